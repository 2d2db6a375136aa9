//! Line-delimited JSON request loop
//!
//! Requests look like `{"action": "get", "target": ["usb"], "params": {}}`
//! and are answered one at a time, in order. Input is read on its own thread
//! so that a `{"signal": "cancel"}` line reaches the request that is running.
//! Signals emitted by an action are written out as `{"signal": name, ...}`
//! lines before the final response.

use std::io::{self, BufRead, Write};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, RpcResult};
use crate::node::{Data, DeviceTree, Params};
use crate::signal::{ActionContext, CancelToken, SignalSink};

/// One request line
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub action: String,
    #[serde(default)]
    pub target: Vec<String>,
    #[serde(default)]
    pub params: Params,
}

/// What the input thread hands to the request loop
enum Incoming {
    Request(Request, CancelToken),
    Malformed(String),
}

/// Encode the outcome of a request as a response object
pub fn response(result: RpcResult<Data>) -> Value {
    match result {
        Ok(data) => {
            let mut body = Data::new();
            body.insert("result".to_string(), json!("success"));
            body.extend(data);
            Value::Object(body)
        }
        Err(e) => error_response(e.kind(), &e.to_string()),
    }
}

fn error_response(kind: ErrorKind, message: &str) -> Value {
    json!({
        "result": "error",
        "status": kind.as_str(),
        "message": message,
        "body": {},
    })
}

/// Shared writer; signals and responses never interleave mid-line
struct LineWriter<W> {
    output: Mutex<W>,
}

impl<W: Write + Send> LineWriter<W> {
    fn send(&self, message: &Value) -> io::Result<()> {
        let mut output = self.output.lock();
        serde_json::to_writer(&mut *output, message)?;
        output.write_all(b"\n")?;
        output.flush()
    }
}

impl<W: Write + Send> SignalSink for LineWriter<W> {
    fn signal(&self, name: &str, body: Data) {
        let mut message = Data::new();
        message.insert("signal".to_string(), json!(name));
        message.extend(body);
        if let Err(e) = self.send(&Value::Object(message)) {
            warn!("Failed to write signal {}: {}", name, e);
        }
    }
}

/// Read lines until EOF, forwarding requests and applying cancel signals
///
/// The latest request is cancelled once input closes.
fn read_input<R: BufRead>(input: R, requests: mpsc::Sender<Incoming>) {
    let mut current = CancelToken::new();

    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("Input closed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                if requests.send(Incoming::Malformed(e.to_string())).is_err() {
                    break;
                }
                continue;
            }
        };

        if let Some(signal) = message.get("signal") {
            match signal.as_str() {
                Some("cancel") => {
                    debug!("cancel requested");
                    current.cancel();
                }
                other => warn!("Ignoring unknown signal: {:?}", other),
            }
            continue;
        }

        let incoming = match serde_json::from_value::<Request>(message) {
            Ok(request) => {
                // Each request runs under a fresh token
                current = CancelToken::new();
                Incoming::Request(request, current.clone())
            }
            Err(e) => Incoming::Malformed(e.to_string()),
        };
        if requests.send(incoming).is_err() {
            break;
        }
    }

    // Nobody is left to cancel a request still waiting on the device
    debug!("input closed, cancelling current request");
    current.cancel();
}

/// Serve requests from `input` until it is exhausted
///
/// Responses and signals are written to `output`, one JSON object per line.
pub fn serve<R, W>(input: R, output: W, tree: &mut DeviceTree) -> io::Result<()>
where
    R: BufRead + Send + 'static,
    W: Write + Send + 'static,
{
    let writer = Arc::new(LineWriter {
        output: Mutex::new(output),
    });
    let (sender, receiver) = mpsc::channel();
    let reader = thread::spawn(move || read_input(input, sender));

    info!("Serving requests");
    for incoming in receiver {
        let message = match incoming {
            Incoming::Request(request, cancel) => {
                let ctx = ActionContext::new(cancel, writer.clone());
                response(tree.call(
                    &request.action,
                    &request.target,
                    request.params,
                    &ctx,
                ))
            }
            Incoming::Malformed(reason) => {
                warn!("Malformed request: {}", reason);
                error_response(ErrorKind::InvalidParams, &format!("Malformed request: {}", reason))
            }
        };
        writer.send(&message)?;
    }

    if reader.join().is_err() {
        warn!("Input thread panicked");
    }
    info!("Input closed, shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::virtual_key::{CaptureStep, VirtualBackend, VirtualKey};
    use std::io::Cursor;

    /// Writer whose contents stay readable after `serve` consumed it
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn lines(&self) -> Vec<Value> {
            String::from_utf8_lossy(&self.0.lock())
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect()
        }

        /// Responses started so far; signals carry no `result` key
        fn responses(&self) -> usize {
            String::from_utf8_lossy(&self.0.lock())
                .matches("\"result\"")
                .count()
        }
    }

    fn run(backend: &VirtualBackend, input: &str) -> Vec<Value> {
        let mut tree = DeviceTree::new(Arc::new(backend.clone()), Arc::new(backend.clone()));
        let output = SharedBuffer::default();
        serve(Cursor::new(input.to_string()), output.clone(), &mut tree).unwrap();
        output.lines()
    }

    #[test]
    fn test_get_root() {
        let lines = run(&VirtualBackend::new(), "{\"action\": \"get\"}\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["result"], "success");
        assert_eq!(lines[0]["data"]["version"], env!("CARGO_PKG_VERSION"));
        assert!(lines[0]["children"].get("usb").is_some());
        assert!(lines[0]["children"].get("nfc").is_some());
    }

    #[test]
    fn test_error_response_shape() {
        let lines = run(
            &VirtualBackend::new(),
            "{\"action\": \"get\", \"target\": [\"nope\"]}\n",
        );
        assert_eq!(lines[0]["result"], "error");
        assert_eq!(lines[0]["status"], "no-such-node");
        assert!(lines[0]["message"].as_str().unwrap().contains("nope"));
        assert_eq!(lines[0]["body"], json!({}));
    }

    #[test]
    fn test_malformed_line_does_not_stop_the_loop() {
        let lines = run(
            &VirtualBackend::new(),
            "not json\n{\"target\": []}\n{\"action\": \"get\"}\n",
        );
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["status"], "invalid-params");
        assert_eq!(lines[1]["status"], "invalid-params");
        assert_eq!(lines[2]["result"], "success");
    }

    #[test]
    fn test_responses_follow_request_order() {
        let backend = VirtualBackend::new();
        backend.plug_usb(VirtualKey::yubikey5(Some(1)));
        let lines = run(
            &backend,
            "{\"action\": \"scan\", \"target\": [\"usb\"]}\n\
             {\"action\": \"get\", \"target\": [\"usb\"]}\n\
             {\"action\": \"frobnicate\", \"target\": [\"usb\"]}\n",
        );
        assert_eq!(lines.len(), 3);
        assert!(lines[0].get("state").is_some());
        assert_eq!(lines[1]["children"].as_object().unwrap().len(), 1);
        assert_eq!(lines[2]["status"], "no-such-action");
    }

    #[test]
    fn test_cancel_applies_to_latest_request() {
        let input = "{\"action\": \"get\"}\n\
                     {\"action\": \"add\", \"target\": [\"usb\"]}\n\
                     {\"signal\": \"cancel\"}\n\
                     {\"signal\": \"bogus\"}\n";
        let (sender, receiver) = mpsc::channel();
        read_input(Cursor::new(input), sender);

        let tokens: Vec<(String, CancelToken)> = receiver
            .into_iter()
            .map(|incoming| match incoming {
                Incoming::Request(request, cancel) => (request.action, cancel),
                Incoming::Malformed(reason) => panic!("unexpected: {}", reason),
            })
            .collect();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].0, "get");
        assert!(!tokens[0].1.is_cancelled());
        assert_eq!(tokens[1].0, "add");
        assert!(tokens[1].1.is_cancelled());
    }

    #[test]
    fn test_closing_input_cancels_latest_request() {
        let input = "{\"action\": \"get\"}\n{\"action\": \"add\", \"target\": [\"usb\"]}";
        let (sender, receiver) = mpsc::channel();
        read_input(Cursor::new(input), sender);

        let cancelled: Vec<bool> = receiver
            .into_iter()
            .map(|incoming| match incoming {
                Incoming::Request(_, cancel) => cancel.is_cancelled(),
                Incoming::Malformed(reason) => panic!("unexpected: {}", reason),
            })
            .collect();
        assert_eq!(cancelled, vec![false, true]);
    }

    /// Input that stays open until the sending side is dropped
    struct ChannelInput {
        lines: mpsc::Receiver<String>,
        pending: Vec<u8>,
    }

    impl io::Read for ChannelInput {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                match self.lines.recv() {
                    Ok(line) => self.pending = line.into_bytes(),
                    Err(_) => return Ok(0),
                }
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending = self.pending.split_off(n);
            Ok(n)
        }
    }

    #[test]
    fn test_signals_precede_response() {
        let backend = VirtualBackend::new();
        backend.plug_usb(
            VirtualKey::bio(Some(8))
                .with_fido_pin("1234")
                .with_capture_script(vec![CaptureStep::Fail(0x03), CaptureStep::Good]),
        );

        let mut tree = DeviceTree::new(Arc::new(backend.clone()), Arc::new(backend.clone()));
        let devices = tree.list(&["usb"]).unwrap();
        let device = devices.keys().next().unwrap().clone();
        let ctap2 = vec!["usb".to_string(), device, "fido".to_string(), "ctap2".to_string()];
        let mut fingerprints = ctap2.clone();
        fingerprints.push("fingerprints".to_string());

        // Keep input open until both responses are out
        let (lines_in, receiver) = mpsc::channel();
        let output = SharedBuffer::default();
        let feeder = {
            let output = output.clone();
            thread::spawn(move || {
                for request in [
                    json!({"action": "verify_pin", "target": ctap2, "params": {"pin": "1234"}}),
                    json!({"action": "add", "target": fingerprints, "params": {}}),
                ] {
                    lines_in.send(format!("{}\n", request)).unwrap();
                }
                while output.responses() < 2 {
                    thread::sleep(std::time::Duration::from_millis(5));
                }
            })
        };
        let input = io::BufReader::new(ChannelInput {
            lines: receiver,
            pending: Vec::new(),
        });
        serve(input, output.clone(), &mut tree).unwrap();
        feeder.join().unwrap();
        let lines = output.lines();

        let signals: Vec<&str> = lines
            .iter()
            .filter_map(|line| line.get("signal").and_then(Value::as_str))
            .collect();
        assert_eq!(signals, vec!["capture", "capture-error", "capture"]);
        let last = lines.last().unwrap();
        assert_eq!(last["result"], "success");
        assert!(last.get("template_id").is_some());
    }
}
