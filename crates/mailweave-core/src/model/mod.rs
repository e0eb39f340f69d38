//! Domain models shared by the workers, the store and the front end.

mod mail;
mod mailbox;
mod thread;

pub use mail::{BodyPart, BodyPath, Filters, FlagSet, FlagUpdate, Mail, SEEN};
pub use mailbox::Mailbox;
pub use thread::{Thread, ThreadNode};
