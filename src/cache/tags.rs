//! Tag Index Module
//!
//! Bidirectional key <-> tag mapping. The copy in the distributed tier is
//! authoritative; each process keeps a local shadow of the links it wrote
//! or observed, used when the distributed tier cannot be reached.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::cache::backend::WriteOp;
use crate::cache::DistributedTier;

#[derive(Debug, Default)]
struct TagShadow {
    by_tag: HashMap<String, HashSet<String>>,
    by_key: HashMap<String, HashSet<String>>,
}

impl TagShadow {
    fn unlink_key(&mut self, key: &str) {
        if let Some(tags) = self.by_key.remove(key) {
            for tag in tags {
                if let Some(keys) = self.by_tag.get_mut(&tag) {
                    keys.remove(key);
                    if keys.is_empty() {
                        self.by_tag.remove(&tag);
                    }
                }
            }
        }
    }

    fn link(&mut self, key: &str, tags: &BTreeSet<String>) {
        self.unlink_key(key);
        if tags.is_empty() {
            return;
        }
        for tag in tags {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.by_key
            .insert(key.to_string(), tags.iter().cloned().collect());
    }
}

/// Tag bookkeeping over the distributed tier.
#[derive(Debug)]
pub struct TagIndex {
    tier: Arc<DistributedTier>,
    shadow: Mutex<TagShadow>,
}

impl TagIndex {
    pub fn new(tier: Arc<DistributedTier>) -> Self {
        Self {
            tier,
            shadow: Mutex::new(TagShadow::default()),
        }
    }

    fn shadow(&self) -> MutexGuard<'_, TagShadow> {
        self.shadow
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replaces the tags of `key`, updating both directions in one atomic batch.
    pub async fn set_tags(&self, key: &str, tags: &BTreeSet<String>, ttl: Option<Duration>) -> bool {
        self.set_tags_many(&[key.to_string()], tags, ttl).await
    }

    /// Replaces the tags of every key in `keys`. Previous links are read in
    /// one pipelined round trip and all updates go out as one atomic batch.
    ///
    /// The key -> tags set shares the entry's TTL. A tag set never expires
    /// before its longest-lived member.
    pub async fn set_tags_many(
        &self,
        keys: &[String],
        tags: &BTreeSet<String>,
        ttl: Option<Duration>,
    ) -> bool {
        let ns = self.tier.namespace();
        let previous = self.links_or_shadow(keys).await;

        let mut ops = Vec::new();
        for key in keys {
            let stale: Vec<&String> = previous
                .get(key)
                .map(|old| old.iter().filter(|tag| !tags.contains(*tag)).collect())
                .unwrap_or_default();
            if tags.is_empty() && stale.is_empty() {
                continue;
            }

            let key_tags_key = ns.key_tags_key(key);
            ops.extend(stale.into_iter().map(|tag| WriteOp::SetRemove {
                key: ns.tag_key(tag),
                members: vec![key.clone()],
            }));
            ops.push(WriteOp::Delete {
                keys: vec![key_tags_key.clone()],
            });
            if tags.is_empty() {
                continue;
            }
            ops.push(WriteOp::SetAdd {
                key: key_tags_key.clone(),
                members: tags.iter().cloned().collect(),
            });
            for tag in tags {
                ops.push(WriteOp::SetAddExtend {
                    key: ns.tag_key(tag),
                    member: key.clone(),
                    ttl,
                });
            }
            if let Some(ttl) = ttl {
                ops.push(WriteOp::Expire {
                    key: key_tags_key,
                    ttl,
                });
            }
        }

        {
            let mut shadow = self.shadow();
            for key in keys {
                shadow.link(key, tags);
            }
        }
        if ops.is_empty() {
            return true;
        }
        let single = match keys {
            [key] => Some(key.as_str()),
            _ => None,
        };
        self.tier.exec("set_tags", single, &ops).await
    }

    /// Keys currently carrying `tag`, resolved against the distributed tier.
    ///
    /// Falls back to the local shadow when the distributed tier fails.
    pub async fn resolve(&self, tag: &str) -> Vec<String> {
        let tag_key = self.tier.namespace().tag_key(tag);
        match self.tier.members(&tag_key).await {
            Some(keys) => keys,
            None => {
                debug!(tag = %tag, "Resolving tag from local shadow");
                self.local_keys(tag)
            }
        }
    }

    /// Authoritative tags of each key, read in pipelined chunks.
    /// `None` when the distributed tier fails.
    pub async fn links(&self, keys: &[String]) -> Option<HashMap<String, Vec<String>>> {
        let ns = self.tier.namespace();
        let set_keys: Vec<String> = keys.iter().map(|k| ns.key_tags_key(k)).collect();
        let members = self.tier.members_many(&set_keys).await?;
        Some(keys.iter().cloned().zip(members).collect())
    }

    async fn links_or_shadow(&self, keys: &[String]) -> HashMap<String, Vec<String>> {
        match self.links(keys).await {
            Some(links) => links,
            None => self.shadow_links(keys),
        }
    }

    fn shadow_links(&self, keys: &[String]) -> HashMap<String, Vec<String>> {
        let shadow = self.shadow();
        keys.iter()
            .map(|key| {
                let tags = shadow
                    .by_key
                    .get(key)
                    .map(|tags| tags.iter().cloned().collect())
                    .unwrap_or_default();
                (key.clone(), tags)
            })
            .collect()
    }

    fn unlink_ops(&self, key: &str, tags: &[String]) -> Vec<WriteOp> {
        let ns = self.tier.namespace();
        let mut ops: Vec<WriteOp> = tags
            .iter()
            .map(|tag| WriteOp::SetRemove {
                key: ns.tag_key(tag),
                members: vec![key.to_string()],
            })
            .collect();
        ops.push(WriteOp::Delete {
            keys: vec![ns.key_tags_key(key)],
        });
        ops
    }

    /// Removes the invalidated `keys` from `tag` and from every other tag
    /// they carried, in one atomic batch. Keys tagged after `keys` was
    /// resolved keep their link.
    ///
    /// `links` are the keys' tags as read from the distributed tier; the
    /// shadow stands in when they are missing.
    pub async fn clear_tag(
        &self,
        tag: &str,
        keys: &[String],
        links: Option<&HashMap<String, Vec<String>>>,
    ) -> bool {
        if keys.is_empty() {
            return true;
        }
        let fallback;
        let links = match links {
            Some(links) => links,
            None => {
                fallback = self.shadow_links(keys);
                &fallback
            }
        };

        let mut ops = vec![WriteOp::SetRemove {
            key: self.tier.namespace().tag_key(tag),
            members: keys.to_vec(),
        }];
        for key in keys {
            let tags = links.get(key).map(Vec::as_slice).unwrap_or_default();
            ops.extend(self.unlink_ops(key, tags));
        }

        {
            let mut shadow = self.shadow();
            for key in keys {
                shadow.unlink_key(key);
            }
        }
        self.tier.exec("clear_tag", None, &ops).await
    }

    /// Removes every tag link of `key`.
    pub async fn forget_key(&self, key: &str) -> bool {
        let keys = [key.to_string()];
        let links = self.links_or_shadow(&keys).await;
        let tags = links.get(key).map(Vec::as_slice).unwrap_or_default();
        let ops = self.unlink_ops(key, tags);

        self.shadow().unlink_key(key);
        self.tier.exec("forget_key", Some(key), &ops).await
    }

    /// Forgets local links for keys purged by a peer's invalidation.
    pub fn forget_local(&self, keys: &[String]) {
        let mut shadow = self.shadow();
        for key in keys {
            shadow.unlink_key(key);
        }
    }

    pub fn local_keys(&self, tag: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .shadow()
            .by_tag
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}
