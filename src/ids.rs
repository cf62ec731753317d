use crate::error::GatewayResult;
use uuid::Uuid;

/// Source of opaque, collision-resistant session identifiers.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> GatewayResult<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> GatewayResult<String> {
        let id = Uuid::new_v4().simple().to_string();
        tracing::debug!(session_id = %id, "Generated session id");
        Ok(id)
    }
}
