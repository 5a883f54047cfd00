//! Status Aggregator: fans a consolidated batch out to the
//! event's subscriber group, plus a legacy-compatibility snapshot on the
//! un-scoped event channel.

use timing_contracts::hub::{HubMessage, LegacyPayload};
use tracing::warn;

use crate::consolidator::Batch;
use crate::ports::Hub;

fn sub_group(event_id: &str) -> String {
    format!("evt{event_id}-sub")
}

/// Sends `batch`'s session and car patches to the event's subscriber
/// group, plus a `Payload`-shaped legacy snapshot (car updates only, no
/// roster) to the bare event-id legacy group.
pub async fn publish_batch<H: Hub>(hub: &H, event_id: &str, batch: Batch) {
    let group = sub_group(event_id);

    if let Some(session) = batch.session {
        if let Err(e) = hub.send_to_group(&group, HubMessage::SessionPatch(session)).await {
            warn!(error = %e, event_id = %event_id, "failed to publish session patch");
        }
    }

    if !batch.cars.is_empty() {
        if let Err(e) = hub
            .send_to_group(&group, HubMessage::CarPatches(batch.cars.clone()))
            .await
        {
            warn!(error = %e, event_id = %event_id, "failed to publish car patches");
        }

        let legacy = LegacyPayload {
            event_id: event_id.to_string(),
            car_position_updates: batch.cars,
        };
        if let Err(e) = hub
            .send_to_group(event_id, HubMessage::ReceiveMessage(legacy))
            .await
        {
            warn!(error = %e, event_id = %event_id, "failed to publish legacy payload");
        }
    }
}
