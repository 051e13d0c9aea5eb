//! Delivery of confirmation codes to the user.

use async_trait::async_trait;

/// Notification title.
pub const APP_NAME: &str = "Trusted Key SSH Agent";

/// Text shown alongside the code.
pub const CONFIRM_MESSAGE: &str = "Verify SSH Login request on your Trusted Key App";

/// Where the 6-digit confirmation code is shown.
///
/// Called exactly once per signing attempt, before the agent starts waiting
/// for the user to confirm on their paired device.  Delivery failures are the
/// sink's own business; the signing flow does not depend on them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, otp: &str);
}
