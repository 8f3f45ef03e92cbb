//! Named, seed-keyed pseudo-random streams.
//!
//! Every run creates its own registry and draws everything (tree shape,
//! latencies, shares, backup selection, failures) from the stream named by its
//! seed, so two runs with the same seed replay exactly.

use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::HashMap;
use rand::rngs::StdRng;
use rand::SeedableRng;

pub type GeneratorHandle = Rc<RefCell<StdRng>>;

/// 32-byte seed derived from a stream name.
pub fn seed_from_name(name: &str) -> [u8; 32] {
    *blake3::hash(name.as_bytes()).as_bytes()
}

pub fn generator_from_name(name: &str) -> GeneratorHandle {
    Rc::new(RefCell::new(StdRng::from_seed(seed_from_name(name))))
}

#[derive(Default)]
pub struct GeneratorRegistry {
    streams: HashMap<String, GeneratorHandle>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream registered under `name`, created on first use.
    pub fn get(&mut self, name: &str) -> GeneratorHandle {
        self.streams
            .entry(name.to_string())
            .or_insert_with(|| generator_from_name(name))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
