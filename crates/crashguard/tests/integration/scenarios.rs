use std::fs;

use crashguard::Disposition;
use crashguard::platform::DumpKind;
use crashguard::types::{AccessKind, AccessViolation, ExceptionCode};
use crashguard_test as test_utils;

use crate::{HANDLER_BASE, MockPlatform, Snapshot, TARGET_BASE, fault, handler, handler_with, raise};

#[test]
fn test_access_violation_in_target() {
    let image_dir = test_utils::tempdir();
    let handler = handler(image_dir.path());
    assert!(handler.install());

    let mut event = fault(ExceptionCode::ACCESS_VIOLATION, TARGET_BASE + 0x1A2B, 7);
    event.access = Some(AccessViolation {
        kind: AccessKind::Read,
        address: 0x18,
    });
    assert_eq!(raise(&handler, &event), Some(Disposition::ContinueSearch));

    let log_path = image_dir.path().join("crashguard_appcrash.log");
    let dump_path = image_dir.path().join("crashguard_appcrash.dmp");

    let report = test_utils::read_artifact(&log_path);
    let report: Vec<_> = report
        .lines()
        .filter(|line| !line.starts_with("Time: "))
        .collect();

    insta::assert_snapshot!(report.join("\n"), @r"
    Unhandled native exception
    Code: C0000005 (STATUS_ACCESS_VIOLATION)
    Address: ffxiv_dx11.exe+1A2B
    Access: read at 0x18

    Call Stack
    {
      [0]	ffxiv_dx11.exe+1A2B
      [1]	ffxiv_dx11.exe+2010	(Framework::Tick+0x10)
      [2]	ffxiv_dx11.exe+3000
    }

    Registers
    {
      RAX:	500000 [ffxiv_dx11.exe+2010	(Framework::Tick+0x10)]
      RBX:	0
      RCX:	ffxiv_dx11.exe+2010	(Framework::Tick+0x10)
      RDX:	0
      R8:	0
      R9:	0
      R10:	0
      R11:	0
      R12:	0
      R13:	0
      R14:	0
      R15:	0
      RSI:	0
      RDI:	0
      RBP:	500040
      RSP:	500000 [ffxiv_dx11.exe+2010	(Framework::Tick+0x10)]
      RIP:	ffxiv_dx11.exe+1A2B
    }

    Stack
    {
      [RSP+0]	ffxiv_dx11.exe+2010	(Framework::Tick+0x10)
      [RSP+8]	0
      [RSP+10]	0
      [RSP+18]	0
      [RSP+20]	0
      [RSP+28]	0
      [RSP+30]	0
      [RSP+38]	0
      [RSP+40]	0
      [RSP+48]	0
      [RSP+50]	0
      [RSP+58]	0
      [RSP+60]	0
      [RSP+68]	0
      [RSP+70]	0
      [RSP+78]	0
    }
    ");

    assert_eq!(&fs::read(&dump_path).unwrap()[..4], b"MDMP");

    let state = handler.platform().state();
    assert_eq!(state.refreshes, 1);
    assert_eq!(
        state.snapshots,
        [Snapshot {
            thread_id: 7,
            kind: DumpKind::DataSegments,
        }]
    );

    assert_eq!(state.alerts.len(), 1);
    let alert = &state.alerts[0];
    assert_eq!(alert.title, "Crash Error");
    assert!(alert.message.contains(&dump_path.display().to_string()));
    assert!(alert.message.contains(&log_path.display().to_string()));
}

#[test]
fn test_ignored_faults() {
    let image_dir = test_utils::tempdir();
    let handler = handler(image_dir.path());
    assert!(handler.install());

    let ignored = [
        // routine exception in the target
        fault(ExceptionCode::BREAKPOINT, TARGET_BASE + 0x1000, 1),
        fault(ExceptionCode::SINGLE_STEP, TARGET_BASE + 0x1000, 1),
        // fatal, but in our own image
        fault(ExceptionCode::ACCESS_VIOLATION, HANDLER_BASE + 0x1000, 1),
        // fatal, but not in any image
        fault(ExceptionCode::ACCESS_VIOLATION, 0xDEAD_0000, 1),
    ];
    for event in &ignored {
        assert_eq!(raise(&handler, event), Some(Disposition::ContinueSearch));
    }

    assert_eq!(fs::read_dir(image_dir.path()).unwrap().count(), 0);
    let state = handler.platform().state();
    assert!(state.alerts.is_empty());
    assert!(state.snapshots.is_empty());
    assert_eq!(state.refreshes, 0);
}

#[test]
fn test_alert_disabled() {
    let image_dir = test_utils::tempdir();
    let handler = handler_with(MockPlatform::new(image_dir.path()), |config| {
        config.alert.enabled = false;
        config.dump_kind = DumpKind::FullMemory;
    });
    assert!(!handler.config().alert.enabled);
    assert!(handler.install());

    let event = fault(ExceptionCode(0xC000_0374), TARGET_BASE + 0x1000, 3);
    assert_eq!(raise(&handler, &event), Some(Disposition::ContinueSearch));

    let report = test_utils::read_artifact(image_dir.path().join("crashguard_appcrash.log"));
    assert!(report.contains("Code: C0000374 (STATUS_HEAP_CORRUPTION)\n"));
    assert!(!report.contains("Access:"));

    let state = handler.platform().state();
    assert!(state.alerts.is_empty());
    assert_eq!(state.snapshots[0].kind, DumpKind::FullMemory);
}

#[test]
fn test_report_failure_continues() {
    let image_dir = test_utils::tempdir();
    let handler = handler_with(MockPlatform::new(image_dir.path()), |config| {
        config.log_file = "missing/crash.log".to_owned();
    });
    assert!(handler.install());

    let event = fault(ExceptionCode::ACCESS_VIOLATION, TARGET_BASE + 0x1000, 1);
    assert_eq!(raise(&handler, &event), Some(Disposition::ContinueSearch));

    assert!(image_dir.path().join("crashguard_appcrash.dmp").is_file());
    let state = handler.platform().state();
    assert_eq!(state.snapshots.len(), 1);
    assert_eq!(state.alerts.len(), 1);
}

#[test]
fn test_snapshot_failure_continues() {
    let image_dir = test_utils::tempdir();
    let handler = handler_with(MockPlatform::new(image_dir.path()).failing_snapshot(), |_| ());
    assert!(handler.install());

    let event = fault(ExceptionCode::ACCESS_VIOLATION, TARGET_BASE + 0x1000, 1);
    assert_eq!(raise(&handler, &event), Some(Disposition::ContinueSearch));

    assert!(image_dir.path().join("crashguard_appcrash.log").is_file());
    assert_eq!(handler.platform().state().alerts.len(), 1);
}

#[test]
fn test_unknown_image_path() {
    let artifact_dir = test_utils::tempdir();
    let log_path = artifact_dir.path().join("crash.log");
    let dump_path = artifact_dir.path().join("crash.dmp");

    // without an image to place them next to, absolute artifact names are used as they are
    let handler = handler_with(MockPlatform::new(artifact_dir.path()).without_image(), |config| {
        config.log_file = log_path.to_string_lossy().into_owned();
        config.dump_file = dump_path.to_string_lossy().into_owned();
    });
    assert!(handler.install());

    let event = fault(ExceptionCode::ACCESS_VIOLATION, TARGET_BASE + 0x1000, 1);
    assert_eq!(raise(&handler, &event), Some(Disposition::ContinueSearch));

    assert!(log_path.is_file());
    assert!(dump_path.is_file());
}

#[test]
fn test_fixed_artifacts_are_overwritten() {
    let image_dir = test_utils::tempdir();
    let handler = handler(image_dir.path());
    assert!(handler.install());

    let first = fault(ExceptionCode::ACCESS_VIOLATION, TARGET_BASE + 0x1000, 1);
    let second = fault(ExceptionCode(0xC000_0094), TARGET_BASE + 0x1000, 2);
    raise(&handler, &first);
    raise(&handler, &second);

    let report = test_utils::read_artifact(image_dir.path().join("crashguard_appcrash.log"));
    assert!(report.contains("STATUS_INTEGER_DIVIDE_BY_ZERO"));
    assert!(!report.contains("STATUS_ACCESS_VIOLATION"));
    assert_eq!(fs::read_dir(image_dir.path()).unwrap().count(), 2);
}

#[test]
fn test_unique_artifacts() {
    let image_dir = test_utils::tempdir();
    let handler = handler_with(MockPlatform::new(image_dir.path()), |config| {
        config.unique_artifacts = true;
    });
    assert!(handler.install());

    for thread_id in [11, 12] {
        let event = fault(ExceptionCode::ACCESS_VIOLATION, TARGET_BASE + 0x1000, thread_id);
        raise(&handler, &event);
    }

    let mut names: Vec<_> = fs::read_dir(image_dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    assert_eq!(names.len(), 4);
    assert!(names[0].starts_with("crashguard_appcrash-") && names[0].ends_with("-11.dmp"));
    assert!(names.iter().any(|name| name.ends_with("-12.log")));
}
