use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "qvm",
    version,
    about = "Run BSD and illumos guests under QEMU with SSH, shared folders and a web console"
)]
pub struct Cli {
    /// Guest OS: freebsd, openbsd, netbsd, dragonflybsd, solaris, omnios, openindiana
    #[arg(long)]
    pub os: String,

    /// Guest release (defaults to the newest known one)
    #[arg(long)]
    pub release: Option<String>,

    /// Guest architecture: x86_64, aarch64 or riscv64 (defaults to the host's)
    #[arg(long)]
    pub arch: Option<String>,

    /// Memory in MB
    #[arg(long, default_value_t = 2048)]
    pub mem: u32,

    /// vCPUs (defaults to the number of host cores)
    #[arg(long)]
    pub cpu: Option<u32>,

    /// QEMU CPU model
    #[arg(long = "cpu-type")]
    pub cpu_type: Option<String>,

    /// NIC model override (e1000, virtio-net-pci, ...)
    #[arg(long = "nc")]
    pub nic: Option<String>,

    /// Boot this qcow2 image instead of the one in the data directory
    #[arg(long)]
    pub qcow2: Option<String>,

    /// Discard disk writes when the session ends
    #[arg(long)]
    pub snapshot: bool,

    /// Host port forwarded to the guest's sshd
    #[arg(long = "ssh-port")]
    pub ssh_port: Option<u16>,

    /// Extra SSH alias for the guest (repeatable)
    #[arg(long = "ssh-name", value_name = "ALIAS")]
    pub ssh_names: Vec<String>,

    /// Port of the host sshd, used by the guest's `host` alias
    #[arg(long = "host-ssh-port")]
    pub host_ssh_port: Option<u16>,

    /// Port forward [tcp|udp:]HOST:GUEST (repeatable)
    #[arg(short = 'p', value_name = "SPEC")]
    pub publish: Vec<String>,

    /// Bind forwards, serial and VNC on all interfaces instead of loopback
    #[arg(long)]
    pub public: bool,

    /// Enable IPv6 in the guest network
    #[arg(long = "enable-ipv6")]
    pub enable_ipv6: bool,

    /// Shared folder HOST:GUEST (repeatable)
    #[arg(short = 'v', value_name = "HOST:GUEST")]
    pub volumes: Vec<String>,

    /// Shared folder mode: rsync (default), sshfs, nfs or scp
    #[arg(long, default_value = "")]
    pub sync: String,

    /// Attach the serial console to this terminal
    #[arg(short = 'c', long, conflicts_with = "detach")]
    pub console: bool,

    /// Leave the VM running and return once it is reachable
    #[arg(short = 'd', long)]
    pub detach: bool,

    /// Host port for the serial console socket
    #[arg(long)]
    pub serial: Option<u16>,

    /// VNC display number, or `off`
    #[arg(long)]
    pub vnc: Option<String>,

    /// Host port for the QEMU monitor (telnet)
    #[arg(long)]
    pub mon: Option<u16>,

    /// Boot x86_64 guests through UEFI
    #[arg(long)]
    pub uefi: bool,

    /// Use WHPX acceleration on Windows hosts
    #[arg(long)]
    pub whpx: bool,

    /// Disk interface override (virtio, ide, nvme, ...)
    #[arg(long)]
    pub disktype: Option<String>,

    /// Directory holding images, firmware vars and session records
    #[arg(long = "data-dir", value_name = "DIR")]
    pub data_dir: Option<String>,

    /// Port for the browser console
    #[arg(long = "web-port")]
    pub web_port: Option<u16>,

    /// Do not serve the browser console
    #[arg(long = "no-web-console")]
    pub no_web_console: bool,

    /// Seconds to wait for the guest's sshd
    #[arg(long = "boot-timeout", default_value_t = 600)]
    pub boot_timeout: u64,

    /// Verbose logging and a serial log file
    #[arg(long)]
    pub debug: bool,

    /// Command to run in the guest over ssh
    #[arg(last = true, value_name = "CMD")]
    pub command: Vec<String>,
}
