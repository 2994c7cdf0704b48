//! sd_notify integration for running `wpmirror run` as a `Type=notify`
//! service.
//!
//! Every method is a no-op when disabled or on non-Linux platforms, so
//! callers never need `#[cfg]`.

#[derive(Debug, Clone, Copy)]
enum Message<'a> {
    Ready,
    Stopping,
    Status(&'a str),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SystemdNotifier {
    enabled: bool,
}

impl SystemdNotifier {
    pub(crate) fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// `READY=1`: the store is open and the loops are running.
    pub(crate) fn notify_ready(&self) {
        self.send(Message::Ready);
    }

    /// `STOPPING=1`: shutdown requested, draining in-flight work.
    pub(crate) fn notify_stopping(&self) {
        self.send(Message::Stopping);
    }

    /// `STATUS=<msg>`, shown by `systemctl status`.
    pub(crate) fn notify_status(&self, msg: &str) {
        self.send(Message::Status(msg));
    }

    fn send(&self, message: Message<'_>) {
        if self.enabled {
            send_impl(message);
        }
    }
}

#[cfg(target_os = "linux")]
fn send_impl(message: Message<'_>) {
    use sd_notify::NotifyState;

    let state = match message {
        Message::Ready => NotifyState::Ready,
        Message::Stopping => NotifyState::Stopping,
        Message::Status(msg) => NotifyState::Status(msg),
    };
    if let Err(e) = sd_notify::notify(false, &[state]) {
        tracing::debug!(error = %e, ?message, "sd_notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn send_impl(_message: Message<'_>) {}
