#[macro_export]
macro_rules! contract_tests_for {
      (
          $mod_name:ident,
          make = $make:expr,
          tests = {
            $( $test_name:ident => $tmpl:path ),+ $(,)?
        }
      ) => {
          mod $mod_name {
              use super::*;

              $(
                  #[test]
                  fn $test_name() {
                      let op = ($make)();
                      $tmpl(op);
                  }
              )+
          }
      };
  }

/// Behaviour every scanner adapter must share
pub mod scanner_contract {
    use crate::error::DeviceError;
    use crate::model::ConnectionKind;
    use crate::ports::{ReaderScanner, UsbScanner};

    pub(crate) fn test_scan_is_stable(scanner: impl UsbScanner) {
        let first = scanner.scan_devices().expect("scan failed");
        let second = scanner.scan_devices().expect("scan failed");
        assert_eq!(first, second);
    }

    pub(crate) fn test_listing_matches_scan(scanner: impl UsbScanner) {
        let scan = scanner.scan_devices().expect("scan failed");
        let devices = scanner.list_all_devices().expect("listing failed");

        assert_eq!(devices.len(), scan.pids.values().sum::<usize>());
        for (device, _) in &devices {
            let pid = device.pid().expect("USB device without product id");
            assert!(scan.pids.contains_key(&pid));
        }
    }

    pub(crate) fn test_listed_devices_report_identity(scanner: impl UsbScanner) {
        for (device, info) in scanner.list_all_devices().expect("listing failed") {
            let kind = ConnectionKind::ALL
                .into_iter()
                .find(|kind| device.supports_connection(*kind))
                .expect("device without any connection kind");

            let mut connection = device.open_connection(kind).expect("open failed");
            let read = connection.read_info(device.pid()).expect("read_info failed");
            connection.close();

            assert_eq!(read.serial, info.serial);
            assert_eq!(read.version, info.version);
        }
    }

    pub(crate) fn test_connect_unknown_serial_fails(scanner: impl UsbScanner) {
        let result = scanner.connect_to_device(Some(u32::MAX), &ConnectionKind::ALL);
        match result {
            Err(DeviceError::NotFound) => { /* ok */ }
            Err(other) => panic!("expected NotFound, got: {other:?}"),
            Ok(_) => panic!("expected NotFound, got a connection"),
        }
    }

    pub(crate) fn test_readers_are_uniquely_named(scanner: impl ReaderScanner) {
        let readers = scanner.list_readers().expect("reader listing failed");
        let mut names: Vec<String> = readers
            .iter()
            .map(|reader| reader.reader_name().expect("reader without name").to_string())
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), readers.len());
    }
}
