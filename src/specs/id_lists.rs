//! Id lists: named sets of (hashed) ids synchronized incrementally.
//!
//! A list is a remote append-only file of newline-delimited `+id` / `-id` records. Clients keep
//! the number of bytes consumed so far and only fetch the tail. A new `fileID` or `creationTime`
//! means the file was rewritten and the local copy must be rebuilt from scratch.
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::hashing::id_list_hash;

/// Entry of the id list manifest (`get_id_lists` response).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdListMetadata {
    pub url: String,
    /// Total size of the remote file in bytes.
    pub size: u64,
    pub creation_time: i64,
    #[serde(rename = "fileID")]
    pub file_id: String,
}

/// What a sync cycle should do with one list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdListSyncAction {
    /// Local copy is up to date.
    Skip,
    /// Fetch bytes starting at `offset` and apply them.
    FetchFrom { offset: u64 },
    /// Drop the local copy and fetch the whole file.
    Reset,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdList {
    pub name: String,
    pub url: String,
    pub file_id: String,
    pub creation_time: i64,
    /// Bytes of the remote file applied so far.
    pub size: u64,
    ids: HashSet<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdListError {
    #[error("id list body is not a +/- record stream")]
    Corrupted,
    #[error("id list grew past the advertised size ({applied} > {advertised})")]
    Overflow { applied: u64, advertised: u64 },
}

impl IdList {
    pub fn new(name: impl Into<String>, metadata: &IdListMetadata) -> IdList {
        IdList {
            name: name.into(),
            url: metadata.url.clone(),
            file_id: metadata.file_id.clone(),
            creation_time: metadata.creation_time,
            size: 0,
            ids: HashSet::new(),
        }
    }

    /// Decide how to bring this list up to date with `metadata`.
    pub fn plan_sync(&self, metadata: &IdListMetadata) -> IdListSyncAction {
        if metadata.file_id != self.file_id || metadata.creation_time > self.creation_time {
            return IdListSyncAction::Reset;
        }
        if metadata.creation_time < self.creation_time {
            // Stale manifest entry, keep what we have.
            return IdListSyncAction::Skip;
        }
        if self.size > metadata.size {
            return IdListSyncAction::Reset;
        }
        if self.size == metadata.size {
            return IdListSyncAction::Skip;
        }
        IdListSyncAction::FetchFrom { offset: self.size }
    }

    /// Apply a chunk of the remote file that starts at the current offset.
    ///
    /// On error the list is left untouched; callers reset it and re-fetch the whole file.
    pub fn apply_chunk(&mut self, body: &str, advertised_size: u64) -> Result<(), IdListError> {
        if body.is_empty() {
            return Ok(());
        }
        if !matches!(body.as_bytes()[0], b'+' | b'-') {
            return Err(IdListError::Corrupted);
        }
        let applied = self.size + body.len() as u64;
        if applied > advertised_size {
            return Err(IdListError::Overflow {
                applied,
                advertised: advertised_size,
            });
        }

        for line in body.lines() {
            let line = line.trim();
            if line.len() < 2 {
                continue;
            }
            let (op, id) = line.split_at(1);
            match op {
                "+" => {
                    self.ids.insert(id.to_owned());
                }
                "-" => {
                    self.ids.remove(id);
                }
                _ => {}
            }
        }
        self.size = applied;
        Ok(())
    }

    /// Check whether a raw (unhashed) id is in the list.
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(&id_list_hash(id))
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(size: u64, file_id: &str, creation_time: i64) -> IdListMetadata {
        IdListMetadata {
            url: "https://idlists.example/list".to_owned(),
            size,
            creation_time,
            file_id: file_id.to_owned(),
        }
    }

    #[test]
    fn applies_adds_and_removes() {
        let a = id_list_hash("a");
        let b = id_list_hash("b");
        let body = format!("+{a}\n+{b}\n-{a}\n");
        let mut list = IdList::new("l", &metadata(body.len() as u64, "f1", 1));

        list.apply_chunk(&body, body.len() as u64).unwrap();

        assert!(!list.contains("a"));
        assert!(list.contains("b"));
        assert_eq!(list.size, body.len() as u64);
    }

    #[test]
    fn corrupted_chunk_is_rejected() {
        let mut list = IdList::new("l", &metadata(10, "f1", 1));
        assert_eq!(
            list.apply_chunk("garbage\n", 10),
            Err(IdListError::Corrupted)
        );
        assert_eq!(list.size, 0);
    }

    #[test]
    fn overflow_is_rejected() {
        let mut list = IdList::new("l", &metadata(3, "f1", 1));
        assert!(matches!(
            list.apply_chunk("+abcdefgh\n", 3),
            Err(IdListError::Overflow { .. })
        ));
    }

    #[test]
    fn plans_incremental_fetch() {
        let mut list = IdList::new("l", &metadata(0, "f1", 1));
        list.size = 10;

        assert_eq!(list.plan_sync(&metadata(10, "f1", 1)), IdListSyncAction::Skip);
        assert_eq!(
            list.plan_sync(&metadata(25, "f1", 1)),
            IdListSyncAction::FetchFrom { offset: 10 }
        );
        assert_eq!(list.plan_sync(&metadata(5, "f1", 1)), IdListSyncAction::Reset);
        assert_eq!(list.plan_sync(&metadata(25, "f2", 1)), IdListSyncAction::Reset);
        assert_eq!(list.plan_sync(&metadata(25, "f1", 2)), IdListSyncAction::Reset);
    }
}
