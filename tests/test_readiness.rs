// Readiness probe against fake guests

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use qvm::error::exit_code;
use qvm::readiness::SshProbe;
use qvm::QvmError;

#[tokio::test]
async fn test_silent_forward_times_out() {
    // accepts connections like a NAT forward but never speaks SSH
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((s, _)) = listener.accept().await {
            held.push(s);
        }
    });

    let probe = SshProbe::new(addr, Duration::from_millis(500))
        .interval(Duration::from_millis(100))
        .banner_timeout(Duration::from_millis(100));
    let err = probe.wait().await.unwrap_err();
    assert!(matches!(err, QvmError::Network(_)));
    let err: anyhow::Error = err.into();
    assert_eq!(exit_code(&err), 7);
}

#[tokio::test]
async fn test_guest_sshd_detected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut s, _)) = listener.accept().await {
            let _ = s.write_all(b"SSH-2.0-OpenSSH_9.7 FreeBSD\r\n").await;
        }
    });

    let banner = SshProbe::new(addr, Duration::from_secs(5)).wait().await.unwrap();
    assert!(banner.contains("FreeBSD"));
}
