use chrono::{DateTime, TimeZone, Utc};
use getset::{CopyGetters, Getters};

use crate::network::{Frame, MessageStatus, ParsedFrame};
use crate::node::Payload;
use crate::AppError;

/// A frame decorated with routing metadata.
///
/// `from_node` is `"<peer-ip>:<reply-port>"` for arrived messages (the reply
/// port is the port the peer listens on, so it can be dialed back directly)
/// and empty for originated ones. `to_node` is the local reply address on
/// arrival and the dialed address on origination.
#[derive(Debug, Getters, CopyGetters)]
pub struct Message<T> {
    #[getset(get_copy = "pub")]
    id: u32,
    #[getset(get_copy = "pub")]
    status: MessageStatus,
    #[getset(get_copy = "pub")]
    reply_port: u16,
    #[getset(get = "pub")]
    from_node: String,
    #[getset(get = "pub")]
    to_node: String,
    #[getset(get_copy = "pub")]
    sent_on: Option<DateTime<Utc>>,
    #[getset(get_copy = "pub")]
    received_on: Option<DateTime<Utc>>,

    pub data: Option<T>,
}

impl<T: Payload> Message<T> {
    /// Message handed back to the sender after a successful `send`.
    pub(crate) fn originated(frame: &Frame, data: Option<T>, to_node: &str) -> Message<T> {
        Message {
            id: frame.id,
            status: frame.status,
            reply_port: frame.reply_port,
            from_node: String::new(),
            to_node: to_node.to_string(),
            sent_on: timestamp(frame.timestamp_ms),
            received_on: None,
            data,
        }
    }

    /// Builds the message for a frame emitted by the parser on arrival.
    ///
    /// The wire timestamp becomes `sent_on` when the frame is an originator
    /// frame; for receipts (both 200 and 201) it is not decoded into the
    /// message, since `received_on` is always this node's own reception
    /// time. A payload that fails the application decode flips the status to
    /// `PayloadCorrupt`; the error is returned alongside so the caller can
    /// report it.
    pub(crate) fn arrived(
        parsed: ParsedFrame,
        peer_host: &str,
        local_address: &str,
    ) -> (Message<T>, Option<AppError>) {
        let ParsedFrame {
            frame,
            wire_status,
            error,
        } = parsed;

        let mut status = frame.status;
        let mut error = error;

        let mut data = None;
        if error.is_none() {
            if let Some(payload) = frame.payload.as_ref() {
                match T::decode(payload) {
                    Ok(value) => data = Some(value),
                    Err(e) => {
                        status = MessageStatus::PayloadCorrupt;
                        error = Some(e);
                    }
                }
            }
        }

        let sent_on = match wire_status {
            MessageStatus::Sent => timestamp(frame.timestamp_ms),
            MessageStatus::Received | MessageStatus::PayloadCorrupt => None,
        };

        let message = Message {
            id: frame.id,
            status,
            reply_port: frame.reply_port,
            from_node: format!("{}:{}", peer_host, frame.reply_port),
            to_node: local_address.to_string(),
            sent_on,
            received_on: Some(Utc::now()),
            data,
        };
        (message, error)
    }
}

fn timestamp(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}
