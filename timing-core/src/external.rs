//! External Enrichers: driver-by-transponder and
//! video-by-event+car cross references, mirrored into a short-TTL cache
//! for replay to newly connected clients and fanned out on change.

use std::time::Duration;

use timing_contracts::hub::{CompetitorMetadataUpdate, HubMessage, InCarVideoMetadata};
use timing_contracts::patch::CarPositionPatch;
use tracing::warn;

use crate::ports::{Hub, MetadataSource, VideoMetadata};
use crate::ttl_cache::TtlCache;

const CACHE_TTL: Duration = Duration::from_secs(60);

/// Caches the last known driver name per transponder and video metadata
/// per `(event, car)`, replaying cached values to a freshly connected
/// subscriber without re-querying the metadata source.
pub struct ExternalEnricher {
    driver_cache: TtlCache<String, String>,
    video_cache: TtlCache<(String, String), VideoMetadata>,
}

impl ExternalEnricher {
    pub fn new() -> Self {
        Self {
            driver_cache: TtlCache::new(CACHE_TTL),
            video_cache: TtlCache::new(CACHE_TTL),
        }
    }

    /// Looks up the driver for `transponder_id`, falling back to cache on
    /// a metadata-source error. Returns a `CarPositionPatch` setting
    /// `driver_name` only when it differs from `current_driver_name`.
    pub async fn enrich_driver<M: MetadataSource>(
        &mut self,
        metadata: &M,
        transponder_id: &str,
        car_number: &str,
        current_driver_name: &str,
    ) -> Option<CarPositionPatch> {
        let driver_name = match metadata.driver_for(transponder_id).await {
            Ok(Some(name)) => {
                self.driver_cache.insert(transponder_id.to_string(), name.clone());
                Some(name)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, transponder = %transponder_id, "driver lookup failed, using cache");
                self.driver_cache.get(&transponder_id.to_string())
            }
        }?;

        if driver_name == current_driver_name {
            return None;
        }

        let mut patch = CarPositionPatch::identity(car_number);
        patch.driver_name = Some(driver_name);
        Some(patch)
    }

    /// Looks up video metadata for `(event_id, car_number)` and, on
    /// change versus cache, publishes it to `group` and updates the
    /// cache for replay.
    pub async fn enrich_video<M: MetadataSource, H: Hub>(
        &mut self,
        metadata: &M,
        hub: &H,
        group: &str,
        event_id: &str,
        car_number: &str,
    ) {
        let key = (event_id.to_string(), car_number.to_string());
        let fetched = match metadata.video_for(event_id, car_number).await {
            Ok(Some(v)) => v,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, car = %car_number, "video lookup failed");
                return;
            }
        };

        let changed = self
            .video_cache
            .get(&key)
            .map(|cached| cached.destinations != fetched.destinations || cached.flags != fetched.flags)
            .unwrap_or(true);

        if !changed {
            return;
        }

        self.video_cache.insert(key, fetched.clone());

        let message = HubMessage::InCarVideoMetadata(InCarVideoMetadata {
            car_number: car_number.to_string(),
            destinations: fetched.destinations,
            flags: fetched.flags,
        });
        if let Err(e) = hub.send_to_group(group, message).await {
            warn!(error = %e, car = %car_number, "failed to publish video metadata");
        }
    }

    /// Emits a `CompetitorMetadata` update for a car whose make/engine
    /// changed, mirrored by the in-car processor's own lookups.
    pub async fn publish_competitor_metadata<H: Hub>(
        &self,
        hub: &H,
        group: &str,
        car_number: &str,
        make: Option<String>,
        engine: Option<String>,
    ) {
        let message = HubMessage::CompetitorMetadata(CompetitorMetadataUpdate {
            car_number: car_number.to_string(),
            make,
            engine,
        });
        if let Err(e) = hub.send_to_group(group, message).await {
            warn!(error = %e, car = %car_number, "failed to publish competitor metadata");
        }
    }
}

impl Default for ExternalEnricher {
    fn default() -> Self {
        Self::new()
    }
}
