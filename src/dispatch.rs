//! Outbound booking notifications (confirmation email and the like).
//!
//! Dispatch happens after the booking is durable and is never awaited by the
//! booking path: a failed notification is logged, the booking stands.

use async_trait::async_trait;
use tracing::info;

use crate::model::Booking;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("notification transport failed: {0}")]
    Transport(String),
    #[error("could not render notification: {0}")]
    Render(String),
}

#[async_trait]
pub trait BookingDispatcher: Send + Sync {
    /// Called once per successful confirm, direct or manual booking.
    async fn booking_created(&self, booking: &Booking) -> Result<(), DispatchError>;
}

/// Writes the booking as a JSON log line.
#[derive(Debug, Default)]
pub struct LogDispatcher;

#[async_trait]
impl BookingDispatcher for LogDispatcher {
    async fn booking_created(&self, booking: &Booking) -> Result<(), DispatchError> {
        let payload =
            serde_json::to_string(booking).map_err(|e| DispatchError::Render(e.to_string()))?;
        let kind = if booking.is_manual() { "manual" } else { "slot" };
        info!(booking_id = %booking.id, kind, "booking notification: {payload}");
        Ok(())
    }
}
