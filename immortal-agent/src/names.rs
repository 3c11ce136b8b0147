//! Human-readable stream names

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use rand::Rng;

/// Random draws before falling back to a timestamp suffix
pub const NAME_ATTEMPTS: usize = 10;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brave", "bright", "calm", "clever", "cosmic", "crisp", "eager", "fancy",
    "gentle", "golden", "happy", "hidden", "jolly", "keen", "lively", "lucky", "mellow", "misty",
    "noble", "proud", "quick", "quiet", "rapid", "silent", "sleepy", "snowy", "steady", "sunny",
    "swift", "tidy", "vivid", "witty", "young", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "canyon", "comet", "falcon", "fern", "fjord", "glacier", "harbor", "heron",
    "island", "lagoon", "lantern", "maple", "meadow", "otter", "panda", "pebble", "pine", "raven",
    "reef", "river", "robin", "sparrow", "summit", "tiger", "tundra", "valley", "walrus", "willow",
];

fn draw(rng: &mut impl Rng) -> String {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(rng).copied().unwrap_or("stream");
    format!("{adjective}-{noun}")
}

/// Pick a name not in `taken`.
///
/// Tries [`NAME_ATTEMPTS`] random draws, then appends the current unix time
/// in nanoseconds to the last draw.
pub fn generate_name(rng: &mut impl Rng, taken: &HashSet<&str>) -> String {
    let mut name = String::new();
    for _ in 0..NAME_ATTEMPTS {
        name = draw(rng);
        if !taken.contains(name.as_str()) {
            return name;
        }
    }

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{name}-{nanos}")
}
