//! Host message reporting.
//!
//! Every message is emitted as a `tracing` event and, if one is installed,
//! forwarded to the message callback of the current host thread. This is the
//! assertion/logging facility the bridge reports contract violations and
//! swallowed script errors through.
//!
//! ```ignore
//! let capture = MessageCapture::start();
//! print_error("something went wrong");
//! assert!(capture.contains("went wrong"));
//! ```

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Severity of a host message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Error,
    Warning,
    Information,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageType::Error => "error",
            MessageType::Warning => "warning",
            MessageType::Information => "info",
        })
    }
}

/// A single reported message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageType,
    pub text: String,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.text)
    }
}

/// Callback receiving every message reported on this thread.
pub type MessageCallbackFn = Box<dyn Fn(&Message)>;

thread_local! {
    static CALLBACK: RefCell<Option<Rc<dyn Fn(&Message)>>> = const { RefCell::new(None) };
}

/// Install (or clear, with `None`) the message callback for the current thread.
///
/// Returns the previously installed callback.
pub fn set_message_callback(callback: Option<MessageCallbackFn>) -> Option<Rc<dyn Fn(&Message)>> {
    let callback: Option<Rc<dyn Fn(&Message)>> = callback.map(Rc::from);
    CALLBACK
        .try_with(|slot| std::mem::replace(&mut *slot.borrow_mut(), callback))
        .ok()
        .flatten()
}

fn restore_message_callback(callback: Option<Rc<dyn Fn(&Message)>>) {
    let _ = CALLBACK.try_with(|slot| *slot.borrow_mut() = callback);
}

/// Report a message.
pub fn report(kind: MessageType, text: impl Into<String>) {
    let message = Message {
        kind,
        text: text.into(),
    };

    match kind {
        MessageType::Error => tracing::error!(target: "variant_bridge", "{}", message.text),
        MessageType::Warning => tracing::warn!(target: "variant_bridge", "{}", message.text),
        MessageType::Information => tracing::info!(target: "variant_bridge", "{}", message.text),
    }

    // Clone the callback out so it may itself report without re-borrowing.
    let callback = CALLBACK
        .try_with(|slot| slot.borrow().clone())
        .ok()
        .flatten();
    if let Some(callback) = callback {
        callback(&message);
    }
}

pub fn print_error(text: impl Into<String>) {
    report(MessageType::Error, text);
}

pub fn print_warning(text: impl Into<String>) {
    report(MessageType::Warning, text);
}

pub fn print_info(text: impl Into<String>) {
    report(MessageType::Information, text);
}

/// Collects messages reported on this thread until dropped.
///
/// The previously installed callback is restored on drop.
pub struct MessageCapture {
    messages: Rc<RefCell<Vec<Message>>>,
    previous: Option<Rc<dyn Fn(&Message)>>,
}

impl MessageCapture {
    pub fn start() -> Self {
        let messages = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&messages);
        let previous = set_message_callback(Some(Box::new(move |m: &Message| {
            sink.borrow_mut().push(m.clone());
        })));
        Self { messages, previous }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.borrow().clone()
    }

    pub fn errors(&self) -> Vec<Message> {
        self.messages
            .borrow()
            .iter()
            .filter(|m| m.kind == MessageType::Error)
            .cloned()
            .collect()
    }

    /// True if any captured message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.messages.borrow().iter().any(|m| m.text.contains(needle))
    }

    pub fn is_empty(&self) -> bool {
        self.messages.borrow().is_empty()
    }
}

impl Drop for MessageCapture {
    fn drop(&mut self) {
        restore_message_callback(self.previous.take());
    }
}

impl fmt::Debug for MessageCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCapture")
            .field("count", &self.messages.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_collects_and_restores() {
        {
            let outer = MessageCapture::start();
            {
                let inner = MessageCapture::start();
                print_warning("inner only");
                assert!(inner.contains("inner only"));
            }
            print_error("outer again");
            assert!(!outer.contains("inner only"));
            assert_eq!(outer.errors().len(), 1);
        }
        // No capture installed: reporting must not panic.
        print_info("nobody listening");
    }

    #[test]
    fn message_display() {
        let m = Message {
            kind: MessageType::Warning,
            text: "careful".into(),
        };
        assert_eq!(m.to_string(), "warning: careful");
    }
}
