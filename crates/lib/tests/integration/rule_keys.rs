use std::fs::{File, OpenOptions};
use std::io::Write;

use quarry_lib::rulekey::{RuleKey, RuleKeyConfiguration};

use super::common::{engine, out_dir, project, t, write};

const SINGLE: &str = r#"{"rules": [{"name": "//x:y", "type": "genrule", "srcs": ["a.txt"]}]}"#;

const CHAIN: &str = r#"{
  "rules": [
    {"name": "//x:z", "type": "genrule", "srcs": ["z.txt"]},
    {"name": "//x:y", "type": "genrule", "srcs": ["a.txt"], "deps": ["//x:z"]}
  ]
}"#;

async fn key(project: &tempfile::TempDir, rule_keys: RuleKeyConfiguration, target: &str) -> RuleKey {
  engine(project, rule_keys, &out_dir(project))
    .rule_key(&t(target))
    .await
    .unwrap()
}

#[tokio::test]
async fn seed_change_invalidates_and_revert_restores() {
  let project = project(SINGLE, &[("a.txt", "hello")]);

  let h1 = key(&project, RuleKeyConfiguration::new("s1", "1"), "//x:y").await;
  let h2 = key(&project, RuleKeyConfiguration::new("s2", "1"), "//x:y").await;
  let again = key(&project, RuleKeyConfiguration::new("s1", "1"), "//x:y").await;

  assert_ne!(h1, h2);
  assert_eq!(h1, again);
}

#[tokio::test]
async fn build_version_contributes() {
  let project = project(SINGLE, &[("a.txt", "hello")]);

  let v1 = key(&project, RuleKeyConfiguration::new("s", "1.0.0"), "//x:y").await;
  let v2 = key(&project, RuleKeyConfiguration::new("s", "1.0.1"), "//x:y").await;
  assert_ne!(v1, v2);
}

#[tokio::test]
async fn flipping_one_input_byte_changes_the_key() {
  let project = project(SINGLE, &[("a.txt", "hello")]);
  let before = key(&project, RuleKeyConfiguration::new("s", "1"), "//x:y").await;

  write(project.path(), "a.txt", "hellp");
  let after = key(&project, RuleKeyConfiguration::new("s", "1"), "//x:y").await;
  assert_ne!(before, after);
}

#[tokio::test]
async fn dependency_changes_reach_dependents() {
  let project = project(CHAIN, &[("a.txt", "a"), ("z.txt", "z")]);
  let before = key(&project, RuleKeyConfiguration::new("s", "1"), "//x:y").await;

  write(project.path(), "z.txt", "changed");
  let after = key(&project, RuleKeyConfiguration::new("s", "1"), "//x:y").await;
  assert_ne!(before, after);
}

#[tokio::test]
async fn oversized_input_is_keyed_by_reference() {
  const LIMIT: u64 = 1024 * 1024;
  let project = project(SINGLE, &[]);
  let path = project.path().join("a.txt");

  let mut file = File::create(&path).unwrap();
  file.write_all(&vec![b'a'; 10 * 1024 * 1024]).unwrap();
  file.sync_all().unwrap();
  drop(file);
  let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();

  let rule_keys = || RuleKeyConfiguration::new("s", "1").with_input_size_limit(LIMIT);
  let before = key(&project, rule_keys(), "//x:y").await;

  // Same size, different content, original mtime.
  let mut file = OpenOptions::new().write(true).open(&path).unwrap();
  file.write_all(b"b").unwrap();
  file.set_modified(mtime).unwrap();
  drop(file);

  let after = key(&project, rule_keys(), "//x:y").await;
  assert_eq!(before, after);

  // Without the limit the content is hashed and the edit shows.
  let unlimited = key(&project, RuleKeyConfiguration::new("s", "1"), "//x:y").await;
  let mut file = OpenOptions::new().write(true).open(&path).unwrap();
  file.write_all(b"a").unwrap();
  file.set_modified(mtime).unwrap();
  drop(file);
  let original_content = key(&project, RuleKeyConfiguration::new("s", "1"), "//x:y").await;
  assert_ne!(unlimited, original_content);
}

#[tokio::test]
async fn missing_source_fails_with_the_path() {
  let project = project(SINGLE, &[]);
  let err = engine(&project, RuleKeyConfiguration::new("s", "1"), &out_dir(&project))
    .rule_key(&t("//x:y"))
    .await
    .unwrap_err();
  assert!(err.to_string().contains("a.txt"), "{err}");
}
