use crate::{
    errors::ServiceError,
    services::payments::{NotificationContext, NotificationResult, PaymentAdapter},
    webhooks::WebhookDedup,
};

/// Authenticates a provider notification and runs it through the replay
/// guard. Dedup happens only after authentication so a forged body cannot
/// burn a legitimate event id.
pub fn validate(
    adapter: &dyn PaymentAdapter,
    dedup: &WebhookDedup,
    ctx: &NotificationContext<'_>,
) -> Result<NotificationResult, ServiceError> {
    let result = adapter.verify_notification(ctx)?;
    dedup.check_and_record(adapter.kind().as_str(), &result.event_id)?;
    Ok(result)
}
