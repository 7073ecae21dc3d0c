//! Display surface
//!
//! The client never touches the surface directly. It holds a
//! [`DisplayHandle`] that can be cloned and used from any thread; commands
//! are applied in order by whoever owns the surface, through [`drive`].

use tokio::sync::mpsc;

/// One update for the display surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayCommand {
    /// Replace the status line
    Status(String),
    /// Replace the received value
    Value(String),
    /// Show a transient notice
    Notice(String),
}

/// The thing that actually shows status and value to the user
pub trait Surface {
    fn set_status(&mut self, text: &str);
    fn set_value(&mut self, text: &str);
    fn notify(&mut self, text: &str);
}

/// Cheap, cloneable sender of display commands
#[derive(Debug, Clone)]
pub struct DisplayHandle {
    tx: mpsc::UnboundedSender<DisplayCommand>,
}

impl DisplayHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DisplayCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn set_status(&self, text: impl Into<String>) {
        self.send(DisplayCommand::Status(text.into()));
    }

    pub fn set_value(&self, text: impl Into<String>) {
        self.send(DisplayCommand::Value(text.into()));
    }

    pub fn notify(&self, text: impl Into<String>) {
        self.send(DisplayCommand::Notice(text.into()));
    }

    fn send(&self, command: DisplayCommand) {
        // the surface may already be gone during shutdown
        if self.tx.send(command).is_err() {
            log::debug!("display closed, update dropped");
        }
    }
}

/// Apply a single command to a surface
pub fn apply<S: Surface + ?Sized>(surface: &mut S, command: &DisplayCommand) {
    match command {
        DisplayCommand::Status(text) => surface.set_status(text),
        DisplayCommand::Value(text) => surface.set_value(text),
        DisplayCommand::Notice(text) => surface.notify(text),
    }
}

/// Apply commands to the surface until every handle is dropped
pub async fn drive<S: Surface>(
    mut rx: mpsc::UnboundedReceiver<DisplayCommand>,
    mut surface: S,
) -> S {
    while let Some(command) = rx.recv().await {
        apply(&mut surface, &command);
    }
    surface
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorded {
        status: String,
        value: String,
        notices: Vec<String>,
    }

    impl Surface for Recorded {
        fn set_status(&mut self, text: &str) {
            self.status = text.to_string();
        }

        fn set_value(&mut self, text: &str) {
            self.value = text.to_string();
        }

        fn notify(&mut self, text: &str) {
            self.notices.push(text.to_string());
        }
    }

    #[tokio::test]
    async fn updates_from_other_threads_arrive_in_order() {
        let (display, rx) = DisplayHandle::channel();

        let remote = display.clone();
        std::thread::spawn(move || {
            remote.set_status("Connecting to device...");
            remote.set_value("1");
            remote.set_value("2");
        })
        .join()
        .unwrap();
        display.notify("Please enable Bluetooth.");
        drop(display);

        let surface = drive(rx, Recorded::default()).await;
        assert_eq!(surface.status, "Connecting to device...");
        assert_eq!(surface.value, "2");
        assert_eq!(surface.notices, vec!["Please enable Bluetooth."]);
    }

    #[test]
    fn sending_after_surface_is_gone_is_harmless() {
        let (display, rx) = DisplayHandle::channel();
        drop(rx);
        display.set_status("Disconnected.");
    }
}
