//! Signal plumbing.
//!
//! Handlers never touch daemon state: each delivery is mapped to a
//! [`SignalEvent`] and sent over a channel consumed by the main loop.
//!
//! | signal            | action            |
//! |-------------------|-------------------|
//! | SIGHUP            | reload config     |
//! | SIGUSR1           | dump state info   |
//! | SIGUSR2           | save state now    |
//! | SIGTERM/INT/QUIT  | graceful shutdown |
//! | SIGPIPE           | ignored           |

use flume::Sender;
use tokio::signal::unix::{signal, SignalKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    ReloadConfig,
    DumpStateInfo,
    SaveState,
    Shutdown,
}

/// Wait for control signals forever, forwarding each as an event.
pub async fn wait_for_signal(tx: Sender<SignalEvent>) -> anyhow::Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;

    loop {
        let event = tokio::select! {
            _ = hangup.recv() => SignalEvent::ReloadConfig,
            _ = usr1.recv() => SignalEvent::DumpStateInfo,
            _ = usr2.recv() => SignalEvent::SaveState,
            _ = terminate.recv() => SignalEvent::Shutdown,
            _ = interrupt.recv() => SignalEvent::Shutdown,
            _ = quit.recv() => SignalEvent::Shutdown,
        };
        tx.send_async(event).await?;
    }
}

/// Broken pipes from short-lived children must not kill the daemon.
pub fn ignore_sigpipe() {
    #[allow(unsafe_code)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}
