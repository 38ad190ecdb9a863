//! Typed hashing protocol for rule keys.
//!
//! Every value is written with a one-byte type tag and, where variable in
//! size, a length prefix. Two different sequences of puts therefore never
//! feed the digest the same bytes.

use sha2::{Digest, Sha256};

use crate::util::hash::ContentHash;

use super::types::RuleKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
  List,
  Map,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperKind {
  BuildRule,
  Tool,
}

pub trait RuleKeyHasher {
  fn put_key(&mut self, key: &str);
  fn put_null(&mut self);
  fn put_bool(&mut self, value: bool);
  fn put_number(&mut self, value: &serde_json::Number);
  fn put_string(&mut self, value: &str);
  fn put_bytes(&mut self, value: &[u8]);
  /// A path whose content hash is part of the key.
  fn put_path(&mut self, path: &str, hash: &ContentHash);
  /// A path identified by reference only: size and modification time.
  fn put_non_hashing_path(&mut self, path: &str, size: u64, mtime_nanos: i128);
  fn put_rule_key(&mut self, key: &RuleKey);
  fn put_container(&mut self, kind: ContainerKind, len: usize);
  fn put_wrapper(&mut self, kind: WrapperKind);
  fn finish(self) -> [u8; 32];
}

#[derive(Default)]
pub struct Sha256RuleKeyHasher {
  digest: Sha256,
}

impl Sha256RuleKeyHasher {
  pub fn new() -> Self {
    Self::default()
  }

  fn tag(&mut self, tag: u8) {
    self.digest.update([tag]);
  }

  fn len_prefixed(&mut self, bytes: &[u8]) {
    self.digest.update((bytes.len() as u64).to_be_bytes());
    self.digest.update(bytes);
  }
}

impl RuleKeyHasher for Sha256RuleKeyHasher {
  fn put_key(&mut self, key: &str) {
    self.tag(b'k');
    self.len_prefixed(key.as_bytes());
  }

  fn put_null(&mut self) {
    self.tag(b'0');
  }

  fn put_bool(&mut self, value: bool) {
    self.tag(b'b');
    self.digest.update([u8::from(value)]);
  }

  fn put_number(&mut self, value: &serde_json::Number) {
    self.tag(b'n');
    self.len_prefixed(value.to_string().as_bytes());
  }

  fn put_string(&mut self, value: &str) {
    self.tag(b's');
    self.len_prefixed(value.as_bytes());
  }

  fn put_bytes(&mut self, value: &[u8]) {
    self.tag(b'x');
    self.len_prefixed(value);
  }

  fn put_path(&mut self, path: &str, hash: &ContentHash) {
    self.tag(b'p');
    self.len_prefixed(path.as_bytes());
    self.digest.update(hash.as_bytes());
  }

  fn put_non_hashing_path(&mut self, path: &str, size: u64, mtime_nanos: i128) {
    self.tag(b'P');
    self.len_prefixed(path.as_bytes());
    self.digest.update(size.to_be_bytes());
    self.digest.update(mtime_nanos.to_be_bytes());
  }

  fn put_rule_key(&mut self, key: &RuleKey) {
    self.tag(b'r');
    self.digest.update(key.as_bytes());
  }

  fn put_container(&mut self, kind: ContainerKind, len: usize) {
    self.tag(b'c');
    self.digest.update([match kind {
      ContainerKind::List => b'l',
      ContainerKind::Map => b'm',
    }]);
    self.digest.update((len as u64).to_be_bytes());
  }

  fn put_wrapper(&mut self, kind: WrapperKind) {
    self.tag(b'w');
    self.digest.update([match kind {
      WrapperKind::BuildRule => b'r',
      WrapperKind::Tool => b't',
    }]);
  }

  fn finish(self) -> [u8; 32] {
    self.digest.finalize().into()
  }
}

/// Forwards every put to `delegate` and counts them.
pub struct CountingRuleKeyHasher<H> {
  delegate: H,
  count: usize,
}

impl<H: RuleKeyHasher> CountingRuleKeyHasher<H> {
  pub fn new(delegate: H) -> Self {
    Self { delegate, count: 0 }
  }

  pub fn count(&self) -> usize {
    self.count
  }
}

impl<H: RuleKeyHasher> RuleKeyHasher for CountingRuleKeyHasher<H> {
  fn put_key(&mut self, key: &str) {
    self.count += 1;
    self.delegate.put_key(key);
  }

  fn put_null(&mut self) {
    self.count += 1;
    self.delegate.put_null();
  }

  fn put_bool(&mut self, value: bool) {
    self.count += 1;
    self.delegate.put_bool(value);
  }

  fn put_number(&mut self, value: &serde_json::Number) {
    self.count += 1;
    self.delegate.put_number(value);
  }

  fn put_string(&mut self, value: &str) {
    self.count += 1;
    self.delegate.put_string(value);
  }

  fn put_bytes(&mut self, value: &[u8]) {
    self.count += 1;
    self.delegate.put_bytes(value);
  }

  fn put_path(&mut self, path: &str, hash: &ContentHash) {
    self.count += 1;
    self.delegate.put_path(path, hash);
  }

  fn put_non_hashing_path(&mut self, path: &str, size: u64, mtime_nanos: i128) {
    self.count += 1;
    self.delegate.put_non_hashing_path(path, size, mtime_nanos);
  }

  fn put_rule_key(&mut self, key: &RuleKey) {
    self.count += 1;
    self.delegate.put_rule_key(key);
  }

  fn put_container(&mut self, kind: ContainerKind, len: usize) {
    self.count += 1;
    self.delegate.put_container(kind, len);
  }

  fn put_wrapper(&mut self, kind: WrapperKind) {
    self.count += 1;
    self.delegate.put_wrapper(kind);
  }

  fn finish(self) -> [u8; 32] {
    self.delegate.finish()
  }
}
