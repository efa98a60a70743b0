use tracing::{info, warn};

use super::bundle::ResourceBundle;
use crate::client::DbClient;
use crate::{HarnessError, Result};

/// Fixed-size array of bundles, one per worker slot, created before any worker starts.
pub struct BundlePool<C: DbClient> {
    bundles: Vec<ResourceBundle<C>>,
}

impl<C: DbClient> BundlePool<C> {
    pub fn create(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(HarnessError::InvalidConfig(
                "bundle pool needs at least one slot".to_string(),
            ));
        }

        let mut bundles = Vec::new();
        bundles.try_reserve_exact(size).map_err(|e| {
            HarnessError::ResourceExhausted(format!("cannot allocate {size} bundles: {e}"))
        })?;
        bundles.extend((0..size).map(ResourceBundle::new));

        info!("Created bundle pool with {} slots", size);
        Ok(Self { bundles })
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// Bundle at `slot`. Slots come from the rotation, which is always reduced modulo
    /// the pool size.
    pub fn get(&self, slot: usize) -> &ResourceBundle<C> {
        &self.bundles[slot]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceBundle<C>> {
        self.bundles.iter()
    }

    /// Close every bundle's version stream, waking all executors.
    pub fn close_streams(&self) {
        for bundle in &self.bundles {
            bundle.close_stream();
        }
    }

    /// Halt every bundle so no further prepare or execute starts anywhere in the pool.
    pub fn halt_all(&self) {
        for bundle in &self.bundles {
            bundle.halt();
        }
    }

    /// Tear down every bundle its owner left open. Returns how many there were.
    pub fn release_remaining(&self, client: &C) -> usize {
        let mut released = 0;
        for bundle in self.bundles.iter().filter(|b| b.is_open()) {
            warn!("Releasing bundle {} left open by its owner", bundle.slot());
            if let Err(e) = bundle.teardown(client) {
                warn!("{}", e.diagnostic());
            }
            released += 1;
        }
        released
    }

    /// Number of bundles whose owner has not torn them down yet.
    pub fn open_count(&self) -> usize {
        self.bundles.iter().filter(|b| b.is_open()).count()
    }
}

impl<C: DbClient> Drop for BundlePool<C> {
    fn drop(&mut self) {
        let open = self.open_count();
        if open > 0 {
            warn!("Dropping bundle pool with {} bundles still open", open);
        }
    }
}
