// Session lifecycle against a stand-in qemu-system-x86_64 on PATH

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use tempfile::TempDir;

use qvm::error::{classify, exit_code};
use qvm::image::GuestImage;
use qvm::network::PortAllocator;
use qvm::profile::{self, HostInfo, HostPlatform, KvmAccess, ResolveOptions};
use qvm::qemu::{
    DisplayOptions, LaunchFlags, LaunchPlan, LaunchPlanBuilder, PortRequests, SessionPorts,
    VncSetting,
};
use qvm::session::{AfterReady, SessionOptions, SessionState, SessionSupervisor};
use qvm::sync::SyncPlanner;
use qvm::types::{Arch, GuestSpec, OsFamily};
use qvm::utils::{is_process_alive, terminate};
use qvm::QvmError;

/// Behaviour is picked from the `-name` argument so tests can share one
/// binary on PATH.
const FAKE_QEMU: &str = r#"#!/bin/sh
name=""
while [ $# -gt 0 ]; do
    if [ "$1" = "-name" ]; then
        name="$2"
    fi
    shift
done
echo $$ > "$(dirname "$0")/$name.pid"
case "$name" in
    exit-*)
        echo "qemu-system-x86_64: -machine pc: unsupported machine type" >&2
        exit 1
        ;;
    bindfail-*)
        echo "qemu-system-x86_64: -netdev user,id=net0: Could not set up host forwarding rule 'tcp:127.0.0.1:10022-:22'" >&2
        exit 1
        ;;
    dies-*)
        sleep 2
        exit 3
        ;;
    *)
        exec sleep 60
        ;;
esac
"#;

/// Directory holding the fake binary, prepended to PATH once per test binary
fn fake_bin_dir() -> &'static Path {
    static DIR: OnceLock<TempDir> = OnceLock::new();
    DIR.get_or_init(|| {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("qemu-system-x86_64");
        std::fs::write(&bin, FAKE_QEMU).unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{}", dir.path().display(), path));
        dir
    })
    .path()
}

fn fake_pid(name: &str) -> u32 {
    let text = std::fs::read_to_string(fake_bin_dir().join(format!("{}.pid", name))).unwrap();
    text.trim().parse().unwrap()
}

fn host() -> HostInfo {
    HostInfo {
        platform: HostPlatform::Linux,
        arch: Some(Arch::X86_64),
        kvm: KvmAccess::Usable,
        hvf: false,
    }
}

fn plan(name: &str, work: &Path, allocator: &mut PortAllocator) -> LaunchPlan {
    let host = host();
    let spec = GuestSpec::new(OsFamily::NetBsd, Arch::X86_64);
    let profile = profile::resolve(&spec, &host, ResolveOptions::default()).unwrap();
    let image = GuestImage {
        name: name.to_string(),
        disk: work.join(format!("{}.qcow2", name)),
        cached_base: None,
        explicit: true,
        work_dir: work.to_path_buf(),
        identity: None,
        guest_pubkey: None,
        pflash: None,
        kernel: None,
    };
    let display = DisplayOptions {
        vnc: VncSetting::Off,
        ..Default::default()
    };
    let ports =
        SessionPorts::allocate(allocator, &PortRequests::default(), &[], &display, false).unwrap();
    LaunchPlanBuilder::new(spec, profile, image, ports, host)
        .display(display)
        .flags(LaunchFlags::default())
        .build()
        .unwrap()
}

struct Harness {
    _work: TempDir,
    sessions: PathBuf,
    allocator: PortAllocator,
    supervisor: SessionSupervisor,
}

fn harness(name: &str, boot_timeout: Duration) -> Harness {
    fake_bin_dir();
    let work = TempDir::new().unwrap();
    let mut allocator = PortAllocator::new();
    let plan = plan(name, work.path(), &mut allocator);

    let sessions = work.path().join("sessions");
    let mut options =
        SessionOptions::new(AfterReady::Detach, work.path().join("ssh"), sessions.clone());
    options.boot_timeout = boot_timeout;
    let sync = SyncPlanner::validate("", &[], work.path()).unwrap();

    Harness {
        supervisor: SessionSupervisor::new(plan, sync, options),
        sessions,
        allocator,
        _work: work,
    }
}

#[tokio::test]
async fn test_immediate_exit_is_process_error() {
    let mut h = harness("exit-vm", Duration::from_secs(5));
    let err = h.supervisor.run(&mut h.allocator).await.unwrap_err();

    assert!(matches!(classify(&err), Some(QvmError::Process(_))));
    assert_eq!(exit_code(&err), 6);
    assert!(format!("{:#}", err).contains("unsupported machine type"));
    assert_eq!(h.supervisor.state(), SessionState::Stopped);
}

#[tokio::test]
async fn test_bind_failure_is_resource_error() {
    let mut h = harness("bindfail-vm", Duration::from_secs(5));
    let err = h.supervisor.run(&mut h.allocator).await.unwrap_err();

    assert!(matches!(classify(&err), Some(QvmError::Resource(_))));
    assert_eq!(exit_code(&err), 4);
    assert_eq!(h.supervisor.state(), SessionState::Stopped);

    let log = h.supervisor.plan().output_log().unwrap();
    let text = std::fs::read_to_string(log).unwrap();
    assert!(text.contains("Could not set up host forwarding rule"));
}

#[tokio::test]
async fn test_exit_during_boot_tears_down() {
    let mut h = harness("dies-vm", Duration::from_secs(30));
    let err = h.supervisor.run(&mut h.allocator).await.unwrap_err();

    assert!(matches!(classify(&err), Some(QvmError::Process(_))));
    assert_eq!(h.supervisor.state(), SessionState::Stopped);
    assert!(!h.sessions.join("dies-vm.json").exists());
}

#[tokio::test]
async fn test_boot_timeout_leaves_qemu_running() {
    let mut h = harness("silent-vm", Duration::from_secs(3));
    let mut states = h.supervisor.subscribe();

    let err = h.supervisor.run(&mut h.allocator).await.unwrap_err();

    assert!(matches!(classify(&err), Some(QvmError::Network(_))));
    assert_eq!(exit_code(&err), 7);
    assert_eq!(h.supervisor.state(), SessionState::Failed);
    assert_eq!(*states.borrow_and_update(), SessionState::Failed);

    let pid = fake_pid("silent-vm");
    assert!(is_process_alive(pid));
    assert!(!h.sessions.join("silent-vm.json").exists());
    terminate(pid);
}
