/*
 * Change detection for the mirrored content.
 *
 * git-sync keeps in a `.git` _file_ (e.g. /git/repo/.git) a relative path to
 * the worktree of the current checkout, which ends with the commit hash:
 *
 *     gitdir: ../.git/worktrees/901551c1bdd2ff5a10f14027667c15a6b3a16777
 *
 * The trailing segment is the fingerprint. The last fingerprint acted upon is
 * kept in the replicated peer state, written by the leader only.
 */

use crate::errors::Result;
use crate::peers::PeerStore;

use log;
use regex::Regex;
use std::sync::OnceLock;

/* peer state key holding the fingerprint */
pub const HASH_KEY: &str = "hash";

/* stored when the marker could not be read or parsed */
pub const HASH_PLACEHOLDER: &str = "failed to fetch hash";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fingerprint {
    /* nothing stored yet: the leader has not seeded the peer state */
    Uninitialized,

    /* the marker was missing, unreadable or unrecognized */
    Placeholder,

    Revision(String),
}

fn marker_format() -> Option<&'static Regex> {
    static MARKER: OnceLock<Option<Regex>> = OnceLock::new();
    MARKER.get_or_init(|| Regex::new(r"^.+/(.+)$").ok()).as_ref()
}

impl Fingerprint {

    /*
     * Extracts the fingerprint out of the marker file contents.
     */
    pub fn from_marker(contents: &str) -> Fingerprint {
	let contents = contents.trim();
	match marker_format().and_then(|re| re.captures(contents)).and_then(|caps| caps.get(1)) {
	    Some(hash) => Fingerprint::from_stored(Some(hash.as_str().to_string())),
	    None => {
		log::debug!("Unrecognized hash file format: {:.100}", contents);
		Fingerprint::Placeholder
	    }
	}
    }

    pub fn from_stored(value: Option<String>) -> Fingerprint {
	match value {
	    None => Fingerprint::Uninitialized,
	    Some(value) if value == HASH_PLACEHOLDER => Fingerprint::Placeholder,
	    Some(value) => Fingerprint::Revision(value),
	}
    }

    /*
     * The value to keep in the peer state; Uninitialized is never written.
     */
    pub fn as_stored(&self) -> Option<&str> {
	match self {
	    Fingerprint::Uninitialized => None,
	    Fingerprint::Placeholder => Some(HASH_PLACEHOLDER),
	    Fingerprint::Revision(hash) => Some(hash.as_str()),
	}
    }

    pub fn has_content(&self) -> bool {
	matches!(self, Fingerprint::Revision(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Changed { previous: Fingerprint, current: Fingerprint },
    Unchanged(Fingerprint),
}

pub struct FingerprintTracker<'a> {
    peers: &'a dyn PeerStore,
}

impl<'a> FingerprintTracker<'a> {

    pub fn new(peers: &'a dyn PeerStore) -> Self {
	Self{ peers }
    }

    pub async fn stored(&self) -> Result<Fingerprint> {
	let value = self.peers.get(HASH_KEY).await?;
	Ok(Fingerprint::from_stored(value))
    }

    /*
     * Compares `current` with the stored fingerprint. Uninitialized differs
     * from everything, so the first observation on a fresh application is
     * always a change.
     */
    pub async fn observe(&self, current: &Fingerprint) -> Result<Observation> {
	let previous = self.stored().await?;
	if &previous == current {
	    return Ok(Observation::Unchanged(previous));
	}
	Ok(Observation::Changed{ previous, current: current.clone() })
    }

    /*
     * Stores `fingerprint` in the peer state. Leadership is checked right
     * here, not cached by the caller: a non-leader skips silently and gets
     * Ok(false).
     */
    pub async fn commit(&self, fingerprint: &Fingerprint) -> Result<bool> {
	if !self.peers.is_leader().await? {
	    log::debug!("store {}: abort: not leader", HASH_KEY);
	    return Ok(false);
	}
	let value = match fingerprint.as_stored() {
	    Some(value) => value,
	    None => return Ok(false),
	};

	log::debug!("storing {}: changed to [{}]", HASH_KEY, value);
	self.peers.set(HASH_KEY, value).await?;
	Ok(true)
    }
}
