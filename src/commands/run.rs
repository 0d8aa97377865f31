use anyhow::Result;
use tracing::{debug, info};

use crate::cli::RunRequest;
use crate::image::ImageLocator;
use crate::network::PortAllocator;
use crate::paths;
use crate::profile::{self, HostInfo};
use crate::qemu::{LaunchPlan, LaunchPlanBuilder, SessionPorts};
use crate::session::{SessionOptions, SessionSupervisor};
use crate::sync::SyncPlanner;

/// Resolve, locate and allocate: everything up to the QEMU argv.
/// Nothing is spawned.
pub fn plan_launch(
    request: &RunRequest,
    host: &HostInfo,
    allocator: &mut PortAllocator,
) -> Result<LaunchPlan> {
    let profile = profile::resolve(&request.spec, host, request.resolve)?;
    debug!(
        target: "session",
        image_id = %profile.image_id,
        firmware = ?profile.firmware,
        accel = profile.accel.as_str(),
        "resolved guest profile"
    );

    let locator = ImageLocator::new(paths::base_dir(), host.platform);
    let image = locator.locate(&request.spec, &profile)?;

    let ports = SessionPorts::allocate(
        allocator,
        &request.ports,
        &request.forwards,
        &request.display,
        request.flags.console,
    )?;

    let plan = LaunchPlanBuilder::new(request.spec.clone(), profile, image, ports, host.clone())
        .forwards(request.forwards.clone())
        .sync(request.sync.mappings().to_vec())
        .display(request.display.clone())
        .flags(request.flags)
        .overrides(request.overrides.clone())
        .build()?;
    Ok(plan)
}

/// Launch a session. Returns the process exit code.
pub async fn cmd_run(request: RunRequest, host: HostInfo) -> Result<i32> {
    info!(
        target: "session",
        os = request.spec.os.as_str(),
        arch = request.spec.arch.as_str(),
        host = ?host.platform,
        "starting qvm"
    );

    let mut allocator = PortAllocator::new();
    let plan = plan_launch(&request, &host, &mut allocator)?;
    for alloc in plan.ports().all() {
        debug!(target: "session", role = %alloc.role, port = alloc.port, auto = alloc.auto_selected, "port assigned");
    }
    info!(target: "qemu", "{}", plan.command_line());

    let base = paths::base_dir();
    let mut options = SessionOptions::new(
        request.after_ready.clone(),
        paths::ssh_dir(),
        paths::sessions_dir(&base),
    );
    options.boot_timeout = request.boot_timeout;
    options.ssh_names = request.ssh_names.clone();
    options.host_ssh_port = request.host_ssh_port;

    let sync: SyncPlanner = request.sync;
    let mut supervisor = SessionSupervisor::new(plan, sync, options);
    supervisor.run(&mut allocator).await
}
