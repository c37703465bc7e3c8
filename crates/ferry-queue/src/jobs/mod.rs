//! Built-in job types

pub mod event;
pub mod mail;

pub use event::{DispatchEventHandler, DispatchEventJob, EventListener, EventListeners};
pub use mail::{LogMailer, MailError, Mailer, SendMailHandler, SendMailJob};
