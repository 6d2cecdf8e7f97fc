use crate::error::Result;

/// Outbound half of the bus. Publishing is fire-and-forget and must not block.
pub trait Transport: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;
}
