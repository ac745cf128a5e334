//! Topic subscription and inbound frame routing.
//!
//! Once a connection reaches `Connected`, every topic of the configured set
//! is subscribed. Inbound `MESSAGE` frames are turned into tagged
//! [`InboundMessage`]s and handed to the single message handler.

use std::sync::{Arc, Mutex};

use anyhow::anyhow;

use crate::client::types::State;
use crate::config::PayloadFormat;
use crate::events::{InboundMessage, Payload};
use crate::protocol::{Command, Frame, headers};
use crate::utils::decode_json;

use super::handshake::error_detail;
use super::inner::ClientInner;

pub(crate) struct SubscriptionHandler;

impl SubscriptionHandler {
    /// Subscribes every topic that resolves against the current identity.
    ///
    /// Identity-scoped topics are skipped when there is no identity; the
    /// broadcast topics are still subscribed.
    pub(crate) fn subscribe_all(inner: &mut ClientInner) {
        let identity = inner.identity.clone();
        if identity.is_none() {
            for pattern in inner.topics.patterns().iter().filter(|p| p.is_scoped()) {
                log::warn!("no identity available, not subscribing to {}", pattern.template);
            }
        }

        for (kind, destination) in inner.topics.resolve(identity.as_deref()) {
            let id = inner.subscriptions.insert(kind, &destination);
            let frame = Frame::new(Command::Subscribe)
                .with_header(headers::ID, id)
                .with_header(headers::DESTINATION, destination.clone())
                .with_header(headers::ACK, "auto");
            let Some(ref outbound) = inner.outbound else {
                return;
            };
            if outbound.send(frame).is_ok() {
                log::debug!("subscribed to {}", destination);
            }
        }
    }

    /// Routes one inbound frame of connection `generation`.
    pub(crate) fn dispatch(client: &Arc<Mutex<ClientInner>>, generation: u64, frame: Frame) {
        match frame.command {
            Command::Message => Self::deliver(client, generation, frame),
            Command::Error => {
                let detail = error_detail(&frame);
                log::error!("broker error: {}", detail);
                let mut inner = client.lock().unwrap();
                inner.report_error(anyhow!("broker error: {}", detail));
            }
            Command::Receipt => {
                log::debug!(
                    "receipt {}",
                    frame.header(headers::RECEIPT_ID).unwrap_or_default()
                );
            }
            other => log::debug!("unexpected {} frame", other),
        }
    }

    fn deliver(client: &Arc<Mutex<ClientInner>>, generation: u64, frame: Frame) {
        let (handler, message) = {
            let mut inner = client.lock().unwrap();
            if !inner.is_current(generation, State::Connected) {
                return;
            }

            let subscription = match frame.header(headers::SUBSCRIPTION) {
                Some(id) => inner.subscriptions.lookup(id),
                None => frame
                    .header(headers::DESTINATION)
                    .and_then(|dest| inner.subscriptions.lookup_destination(dest)),
            };
            let Some(subscription) = subscription else {
                log::debug!(
                    "dropping message for unknown subscription, destination={:?}",
                    frame.header(headers::DESTINATION)
                );
                return;
            };
            let kind = subscription.kind.clone();
            let destination = frame
                .header(headers::DESTINATION)
                .map(str::to_string)
                .unwrap_or_else(|| subscription.destination.to_string());

            let payload = match inner.payload_format {
                PayloadFormat::Raw => Payload::Raw(frame.body.clone()),
                PayloadFormat::Json => match decode_json(&frame.body) {
                    Ok(value) => Payload::Json(value),
                    Err(err) => {
                        log::warn!("dropping undecodable message from {}: {}", destination, err);
                        inner.report_error(anyhow!(
                            "undecodable message from {}: {}",
                            destination,
                            err
                        ));
                        return;
                    }
                },
            };

            let message = InboundMessage {
                kind,
                destination,
                message_id: frame.header(headers::MESSAGE_ID).map(str::to_string),
                content_type: frame.header(headers::CONTENT_TYPE).map(str::to_string),
                payload,
            };

            (inner.on_message.take(), message)
        };

        let Some(mut handler) = handler else {
            log::debug!("no message handler, dropping message from {}", message.destination);
            return;
        };

        // the handler runs unlocked so it may call back into the client
        handler(message);

        let mut inner = client.lock().unwrap();
        if inner.on_message.is_none() {
            inner.on_message = Some(handler);
        }
    }
}
