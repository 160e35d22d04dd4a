//! Whimsical auto-names for freshly discovered sessions.
//!
//! `<adjective>-<noun>` drawn uniformly from two fixed lists. The first
//! name assigned to a session is persisted under `names/<sessionId>` and
//! reused for the session's whole life, so every daemon restart shows the
//! same label.

use std::fs;
use std::io;

use rand::seq::SliceRandom;

use crate::ident::validate_id;
use crate::paths::ControlDir;

const ADJECTIVES: &[&str] = &[
    "amber", "ancient", "arctic", "autumn", "azure", "bold", "brave", "breezy", "bright",
    "bronze", "calm", "candid", "cheery", "chilly", "cobalt", "coral", "cosmic", "crimson",
    "curious", "dapper", "daring", "dawn", "deft", "dusky", "eager", "earnest", "electric",
    "emerald", "fabled", "fearless", "feral", "fleet", "floral", "foggy", "frosty", "gentle",
    "gilded", "glacial", "gleaming", "golden", "graceful", "hardy", "hazel", "hidden",
    "honest", "humble", "indigo", "ivory", "jade", "jolly", "keen", "kindly", "lively",
    "lucid", "lunar", "mellow", "merry", "mighty", "misty", "mossy", "nimble", "noble",
    "ochre", "opal", "pearly", "placid", "plucky", "polar", "proud", "quiet", "radiant",
    "rapid", "restless", "rosy", "ruby", "rustic", "sable", "sage", "scarlet", "serene",
    "silent", "silver", "sleek", "solar", "spry", "stellar", "stormy", "sturdy", "sunny",
    "swift", "tranquil", "velvet", "vivid", "wandering", "wild",
];

const NOUNS: &[&str] = &[
    "antelope", "aspen", "badger", "beacon", "bison", "bluff", "brook", "canyon", "cedar",
    "cinder", "comet", "condor", "coyote", "crane", "creek", "crow", "delta", "dune",
    "eagle", "ember", "falcon", "fern", "finch", "fjord", "fox", "gale", "glacier", "glade",
    "grove", "harbor", "hare", "hawk", "heron", "hollow", "ibis", "inlet", "jay", "juniper",
    "kestrel", "knoll", "lagoon", "lark", "lichen", "lynx", "maple", "marmot", "marsh",
    "meadow", "mesa", "moth", "newt", "oak", "orchid", "osprey", "otter", "owl", "peak",
    "pebble", "pine", "plover", "pond", "prairie", "puffin", "quail", "quartz", "raven",
    "reef", "ridge", "river", "robin", "sparrow", "spring", "sprout", "squall", "starling",
    "stoat", "stone", "summit", "swallow", "tarn", "teal", "tern", "thicket", "thistle",
    "tide", "trail", "tundra", "vale", "walnut", "willow", "wolf", "wren", "zephyr",
];

/// One uniformly random `<adjective>-<noun>` label.
pub fn whimsical_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES
        .choose(&mut rng)
        .copied()
        .unwrap_or("quiet");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("fox");
    format!("{adjective}-{noun}")
}

/// Persisted name for `session_id`, generating and saving one on first
/// sight. A name on disk that fails the safe-id check is discarded and
/// regenerated.
pub fn load_or_assign(dir: &ControlDir, session_id: &str) -> io::Result<String> {
    let path = dir.name_file(session_id);
    if let Ok(existing) = fs::read_to_string(&path) {
        let existing = existing.trim();
        if !existing.is_empty() && validate_id(existing).is_ok() {
            return Ok(existing.to_owned());
        }
    }
    let name = whimsical_name();
    fs::create_dir_all(dir.names_dir())?;
    fs::write(&path, &name)?;
    Ok(name)
}
