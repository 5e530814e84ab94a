//! Cluster command envelope and dispatch registry
//!
//! Every group message starts with a one-byte command tag. The rest of the
//! payload is command specific. Receivers decode the envelope into a
//! [`ClusterCommand`] and hand it to the handler registered for its tag.
//!
//! # Wire format
//!
//! ```text
//! RUN_REMOVE
//! ┌─────┬──────────────────┬───────┬─────────────┬──────────────────────┐
//! │ tag │ older_than (i64) │ force │ len (u32)   │ ProgressEvent bytes  │
//! │ 1 B │ 8 B, big-endian  │ 1 B   │ 4 B, BE     │ len B (bincode)      │
//! └─────┴──────────────────┴───────┴─────────────┴──────────────────────┘
//! ```

use crate::error::{ClusterError, ClusterResult};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use dedupio_common::ProgressEvent;
use std::sync::Arc;
use tracing::debug;

/// Command tags
pub mod tags {
    /// Remove chunks that have not been referenced since a threshold
    pub const RUN_REMOVE: u8 = 0x1c;
}

/// Fixed part of a `RUN_REMOVE` payload: tag, threshold, force, length
const REMOVE_HEADER_LEN: usize = 1 + 8 + 1 + 4;

/// "Remove chunks older than T" request sent to every storage node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoveChunksCommand {
    /// Chunks last referenced before this time (epoch millis) are candidates
    pub older_than: i64,
    /// Bypass the soft-delete grace period
    pub force: bool,
    /// Initiator's event at the time of the broadcast
    pub event: ProgressEvent,
}

impl RemoveChunksCommand {
    fn encode_into(&self, buf: &mut BytesMut) -> ClusterResult<()> {
        let event = self.event.to_bytes()?;
        let len = u32::try_from(event.len())
            .map_err(|_| ClusterError::Codec(format!("event too large: {} bytes", event.len())))?;

        buf.reserve(REMOVE_HEADER_LEN + event.len());
        buf.put_u8(tags::RUN_REMOVE);
        buf.put_i64(self.older_than);
        buf.put_u8(u8::from(self.force));
        buf.put_u32(len);
        buf.put_slice(&event);
        Ok(())
    }

    /// Decode the body following the tag byte
    fn decode_body(mut body: Bytes) -> ClusterResult<Self> {
        if body.remaining() < REMOVE_HEADER_LEN - 1 {
            return Err(ClusterError::Codec(format!(
                "RUN_REMOVE header truncated: {} bytes",
                body.remaining()
            )));
        }
        let older_than = body.get_i64();
        let force = match body.get_u8() {
            0 => false,
            1 => true,
            other => {
                return Err(ClusterError::Codec(format!("invalid force flag: {other}")));
            }
        };
        let len = body.get_u32() as usize;
        if body.remaining() != len {
            return Err(ClusterError::Codec(format!(
                "RUN_REMOVE event length {len} but {} bytes follow",
                body.remaining()
            )));
        }
        let event = ProgressEvent::from_bytes(&body)?;
        Ok(Self {
            older_than,
            force,
            event,
        })
    }
}

/// Tagged command envelope
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterCommand {
    RemoveChunks(RemoveChunksCommand),
}

impl ClusterCommand {
    /// Tag byte identifying this command on the wire
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::RemoveChunks(_) => tags::RUN_REMOVE,
        }
    }

    /// Serialize to a broadcast payload
    pub fn encode(&self) -> ClusterResult<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            Self::RemoveChunks(cmd) => cmd.encode_into(&mut buf)?,
        }
        Ok(buf.freeze())
    }

    /// Deserialize a broadcast payload
    pub fn decode(mut payload: Bytes) -> ClusterResult<Self> {
        if !payload.has_remaining() {
            return Err(ClusterError::Codec("empty payload".to_string()));
        }
        match payload.get_u8() {
            tags::RUN_REMOVE => Ok(Self::RemoveChunks(RemoveChunksCommand::decode_body(
                payload,
            )?)),
            other => Err(ClusterError::UnknownCommand(other)),
        }
    }
}

/// Receiver-side handler for one command tag
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handler name for logging
    fn name(&self) -> &str;

    /// Execute the command; `Ok(None)` means "done, nothing to return"
    async fn handle(&self, command: ClusterCommand) -> ClusterResult<Option<Bytes>>;
}

/// Maps command tags to handlers. New commands register additively.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: DashMap<u8, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the tag
    pub fn register(&self, tag: u8, handler: Arc<dyn CommandHandler>) {
        debug!("Registering command handler {} for tag {:#04x}", handler.name(), tag);
        self.handlers.insert(tag, handler);
    }

    /// Whether a handler exists for `tag`
    pub fn handles(&self, tag: u8) -> bool {
        self.handlers.contains_key(&tag)
    }

    /// Decode a payload and run the matching handler
    pub async fn dispatch(&self, payload: Bytes) -> ClusterResult<Option<Bytes>> {
        let command = ClusterCommand::decode(payload)?;
        let handler = self
            .handlers
            .get(&command.tag())
            .map(|h| Arc::clone(h.value()))
            .ok_or(ClusterError::UnknownCommand(command.tag()))?;
        handler.handle(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dedupio_common::EventKind;

    struct Echo;

    #[async_trait]
    impl CommandHandler for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn handle(&self, command: ClusterCommand) -> ClusterResult<Option<Bytes>> {
            Ok(Some(command.encode()?))
        }
    }

    fn sample() -> RemoveChunksCommand {
        RemoveChunksCommand {
            older_than: 1_700_000_000_000,
            force: true,
            event: ProgressEvent::new(EventKind::Gc, "sweep"),
        }
    }

    #[test]
    fn test_remove_payload_layout() {
        let cmd = sample();
        let event_len = cmd.event.to_bytes().unwrap().len();
        let payload = ClusterCommand::RemoveChunks(cmd).encode().unwrap();

        assert_eq!(payload.len(), REMOVE_HEADER_LEN + event_len);
        assert_eq!(payload[0], tags::RUN_REMOVE);
        assert_eq!(&payload[1..9], &1_700_000_000_000i64.to_be_bytes());
        assert_eq!(payload[9], 1);
        assert_eq!(&payload[10..14], &(event_len as u32).to_be_bytes());
    }

    #[test]
    fn test_decode_remove() {
        let cmd = sample();
        let payload = ClusterCommand::RemoveChunks(cmd.clone()).encode().unwrap();
        assert_eq!(
            ClusterCommand::decode(payload).unwrap(),
            ClusterCommand::RemoveChunks(cmd)
        );
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            ClusterCommand::decode(Bytes::new()),
            Err(ClusterError::Codec(_))
        ));
        assert!(matches!(
            ClusterCommand::decode(Bytes::from_static(&[0x7f])),
            Err(ClusterError::UnknownCommand(0x7f))
        ));
        assert!(matches!(
            ClusterCommand::decode(Bytes::from_static(&[tags::RUN_REMOVE, 0, 0])),
            Err(ClusterError::Codec(_))
        ));

        let mut payload = BytesMut::from(
            &ClusterCommand::RemoveChunks(sample()).encode().unwrap()[..],
        );
        payload[9] = 2;
        assert!(matches!(
            ClusterCommand::decode(payload.freeze()),
            Err(ClusterError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_dispatch() {
        let registry = CommandRegistry::new();
        let payload = ClusterCommand::RemoveChunks(sample()).encode().unwrap();

        assert!(matches!(
            registry.dispatch(payload.clone()).await,
            Err(ClusterError::UnknownCommand(tags::RUN_REMOVE))
        ));

        registry.register(tags::RUN_REMOVE, Arc::new(Echo));
        assert!(registry.handles(tags::RUN_REMOVE));
        let reply = registry.dispatch(payload.clone()).await.unwrap();
        assert_eq!(reply, Some(payload));
    }
}
