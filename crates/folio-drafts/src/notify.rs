//! Transient user-facing notices ("toasts").

use smol_str::SmolStr;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    /// Field key, section key or image source the notice is about.
    pub subject: Option<SmolStr>,
}

#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Notice>,
}

impl Notifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }

    pub fn notify(&self, level: NoticeLevel, subject: Option<&str>, message: impl Into<String>) {
        let _ = self.sender.send(Notice {
            level,
            message: message.into(),
            subject: subject.map(SmolStr::new),
        });
    }

    pub fn info(&self, subject: Option<&str>, message: impl Into<String>) {
        self.notify(NoticeLevel::Info, subject, message);
    }

    pub fn error(&self, subject: Option<&str>, message: impl Into<String>) {
        self.notify(NoticeLevel::Error, subject, message);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.sender.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
