use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::bus::Payload;
use crate::error::{BusError, Result};
use crate::message::AsyncRequest;

type DecodeFn = fn(&str) -> Result<Payload>;

/// Message name → decode function table for persisted async requests.
///
/// Filled once at startup (usually through [`crate::Bus::register_async`]),
/// read by the worker pool for every claimed job.
#[derive(Default)]
pub struct Marshaller {
    known: RwLock<HashMap<&'static str, DecodeFn>>,
}

impl Marshaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `R` decodable from its persisted form.
    ///
    /// # Panics
    ///
    /// Registering the same name twice is a programming error and panics.
    pub fn register<R: AsyncRequest>(&self) {
        let mut known = self.known.write().unwrap_or_else(PoisonError::into_inner);
        if known.insert(R::NAME, decode::<R>).is_some() {
            panic!("duplicate marshalling registration for {}", R::NAME);
        }
        debug!(message_name = R::NAME, "registered for marshalling");
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.known
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Every registered name, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let known = self.known.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = known.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Serialize a request into its persisted form.
    pub fn encode<R: AsyncRequest>(&self, request: &R) -> Result<String> {
        serde_json::to_string(request).map_err(BusError::Encode)
    }

    /// Rehydrate a request from its name and persisted form.
    pub fn decode(&self, name: &str, data: &str) -> Result<Payload> {
        let decode = self
            .known
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .ok_or_else(|| BusError::UnknownMessage {
                name: name.to_string(),
            })?;
        decode(data)
    }
}

fn decode<R: AsyncRequest>(data: &str) -> Result<Payload> {
    let request: R = serde_json::from_str(data).map_err(|source| BusError::Decode {
        name: R::NAME.to_string(),
        source,
    })?;
    Ok(Box::new(request))
}
