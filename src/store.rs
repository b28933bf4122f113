//! Ordered key/value store used to hold the demo credentials.
//!
//! The map is a skip list whose forward links are arena indices rather than
//! pointers; removed slots go onto a free list for reuse. Level selection is
//! the usual coin flip. [`Credentials`] serializes every operation behind a
//! single mutex and exposes the [`CredentialStore`] seam the request parser
//! depends on.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use rand::Rng;

const MAX_LEVEL: usize = 16;

#[derive(Debug)]
struct Node<K, V> {
    key: K,
    value: V,
    /// One link per level this node participates in.
    forward: Vec<Option<usize>>,
}

/// An ordered map with probabilistic O(log n) search, insert, and remove.
#[derive(Debug)]
pub struct SkipList<K, V> {
    head: Vec<Option<usize>>,
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    len: usize,
}

impl<K: Ord, V> SkipList<K, V> {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self {
            head: vec![None; MAX_LEVEL],
            nodes: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn node(&self, i: usize) -> &Node<K, V> {
        self.nodes[i].as_ref().expect("dangling skip-list index")
    }

    fn random_level() -> usize {
        let mut rng = rand::thread_rng();
        let mut level = 1;
        while level < MAX_LEVEL && rng.gen_bool(0.5) {
            level += 1;
        }
        level
    }

    /// Per level, the last node strictly before `key` (`None` = the head),
    /// plus the level-0 successor of the lowest predecessor.
    fn find(&self, key: &K) -> ([Option<usize>; MAX_LEVEL], Option<usize>) {
        let mut preds = [None; MAX_LEVEL];
        let mut cur: Option<usize> = None;
        for level in (0..MAX_LEVEL).rev() {
            loop {
                let next = match cur {
                    None => self.head[level],
                    Some(i) => self.node(i).forward.get(level).copied().flatten(),
                };
                match next {
                    Some(j) if self.node(j).key < *key => cur = Some(j),
                    _ => break,
                }
            }
            preds[level] = cur;
        }
        let next = match cur {
            None => self.head[0],
            Some(i) => self.node(i).forward[0],
        };
        (preds, next)
    }

    /// Looks up `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        let (_, cand) = self.find(key);
        cand.map(|i| self.node(i))
            .filter(|node| node.key == *key)
            .map(|node| &node.value)
    }

    /// Inserts `key` with `value`, updating in place and returning the
    /// previous value when the key already exists.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let (preds, cand) = self.find(&key);
        if let Some(i) = cand {
            if self.node(i).key == key {
                let node = self.nodes[i].as_mut().expect("dangling skip-list index");
                return Some(std::mem::replace(&mut node.value, value));
            }
        }

        let level = Self::random_level();
        let mut forward = Vec::with_capacity(level);
        for l in 0..level {
            let next = match preds[l] {
                None => self.head[l],
                Some(p) => self.node(p).forward.get(l).copied().flatten(),
            };
            forward.push(next);
        }

        let idx = match self.free.pop() {
            Some(i) => {
                self.nodes[i] = Some(Node { key, value, forward });
                i
            }
            None => {
                self.nodes.push(Some(Node { key, value, forward }));
                self.nodes.len() - 1
            }
        };

        for l in 0..level {
            match preds[l] {
                None => self.head[l] = Some(idx),
                Some(p) => {
                    self.nodes[p].as_mut().expect("dangling skip-list index").forward[l] =
                        Some(idx);
                }
            }
        }
        self.len += 1;
        None
    }

    /// Removes `key`, returning its value when present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (preds, cand) = self.find(key);
        let i = cand?;
        if self.node(i).key != *key {
            return None;
        }
        let levels = self.node(i).forward.len();
        for l in 0..levels {
            let next = self.node(i).forward[l];
            match preds[l] {
                None => self.head[l] = next,
                Some(p) => {
                    self.nodes[p].as_mut().expect("dangling skip-list index").forward[l] = next;
                }
            }
        }
        let node = self.nodes[i].take().expect("dangling skip-list index");
        self.free.push(i);
        self.len -= 1;
        Some(node.value)
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        std::iter::successors(self.head[0], move |&i| self.node(i).forward[0]).map(move |i| {
            let node = self.node(i);
            (&node.key, &node.value)
        })
    }
}

impl<K: Ord, V> Default for SkipList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Lookup seam the request parser uses to validate login forms.
pub trait CredentialStore: Send + Sync {
    /// True when `user` exists and its stored password equals `pass`.
    fn verify(&self, user: &str, pass: &str) -> bool;
}

/// Mutex-guarded credential table with text dump/load persistence.
#[derive(Debug)]
pub struct Credentials {
    inner: Mutex<SkipList<String, String>>,
}

impl Credentials {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SkipList::new()),
        }
    }

    /// Stores `pass` for `user`, returning any previous password.
    pub fn insert(&self, user: &str, pass: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .insert(user.to_owned(), pass.to_owned())
    }

    /// Looks up the password stored for `user`.
    pub fn get(&self, user: &str) -> Option<String> {
        self.inner.lock().unwrap().get(&user.to_owned()).cloned()
    }

    /// Removes `user`, returning the stored password when present.
    pub fn remove(&self, user: &str) -> Option<String> {
        self.inner.lock().unwrap().remove(&user.to_owned())
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// True when no records are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes every record as one whitespace-separated `user pass` line.
    pub fn dump(&self, path: &Path) -> io::Result<()> {
        let list = self.inner.lock().unwrap();
        let mut out = String::new();
        for (user, pass) in list.iter() {
            out.push_str(user);
            out.push(' ');
            out.push_str(pass);
            out.push('\n');
        }
        fs::write(path, out)
    }

    /// Inserts one record per `user pass` line of the file; malformed lines
    /// are skipped.
    pub fn load(&self, path: &Path) -> io::Result<()> {
        let text = fs::read_to_string(path)?;
        let mut list = self.inner.lock().unwrap();
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            if let (Some(user), Some(pass)) = (fields.next(), fields.next()) {
                list.insert(user.to_owned(), pass.to_owned());
            }
        }
        Ok(())
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for Credentials {
    fn verify(&self, user: &str, pass: &str) -> bool {
        self.get(user).map_or(false, |stored| stored == pass)
    }
}
