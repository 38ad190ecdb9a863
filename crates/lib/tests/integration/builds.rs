use std::sync::Arc;

use quarry_lib::cache::{CacheMode, MemoryArtifactCache};
use quarry_lib::engine::{BuildError, NodeOutcome, SuccessType};
use quarry_lib::rulekey::RuleKeyConfiguration;

use super::common::{engine, out_dir, project, t, write};

/// `//app:greet` reads its dependency's output through `$outputs`. Both
/// commands only use shell builtins since `PATH` is unset for steps.
const GREETING: &str = r#"{
  "rules": [
    {
      "name": "//gen:hello",
      "type": "genrule",
      "srcs": ["name.txt"],
      "steps": [{"kind": "cmd", "cmd": "read name < \"$root/name.txt\"; echo \"hello $name\" > \"$out/hello.txt\""}]
    },
    {
      "name": "//app:greet",
      "type": "genrule",
      "deps": ["//gen:hello"],
      "steps": [
        {"kind": "cmd", "cmd": "read line < \"$outputs/gen/__hello__/hello.txt\"; echo \"$line!\" > \"$out/greet.txt\""},
        {"kind": "write_file", "path": "meta/info.txt", "content": "greet"}
      ]
    }
  ]
}"#;

fn rule_keys() -> RuleKeyConfiguration {
  RuleKeyConfiguration::new("s1", "test")
}

fn read(path: std::path::PathBuf) -> String {
  std::fs::read_to_string(path).unwrap()
}

#[cfg(unix)]
#[tokio::test]
async fn builds_then_reuses_then_rebuilds_on_change() {
  let project = project(GREETING, &[("name.txt", "quarry\n")]);
  let out = out_dir(&project);

  let report = engine(&project, rule_keys(), &out).build(&[]).await.unwrap();
  assert!(report.is_success(), "{:?}", report.failures());
  assert_eq!(report.success_type(&t("//app:greet")), Some(&SuccessType::BuiltLocally));
  assert_eq!(read(out.join("app/__greet__/greet.txt")), "hello quarry!\n");
  assert_eq!(read(out.join("app/__greet__/meta/info.txt")), "greet");
  assert!(!out.join("app/__greet__/tmp").exists());

  let report = engine(&project, rule_keys(), &out).build(&[]).await.unwrap();
  assert_eq!(report.success_counts().get("matching"), Some(&2));

  write(project.path(), "name.txt", "world\n");
  let report = engine(&project, rule_keys(), &out).build(&[]).await.unwrap();
  assert_eq!(report.success_counts().get("built"), Some(&2));
  assert_eq!(read(out.join("app/__greet__/greet.txt")), "hello world!\n");
}

#[cfg(unix)]
#[tokio::test]
async fn shared_cache_serves_a_second_output_root() {
  let project = project(GREETING, &[("name.txt", "quarry\n")]);
  let cache = Arc::new(MemoryArtifactCache::new("shared", CacheMode::Local));

  let first = project.path().join("first");
  let report = engine(&project, rule_keys(), &first)
    .with_cache(cache.clone())
    .build(&[])
    .await
    .unwrap();
  assert!(report.is_success());
  assert_eq!(cache.len(), 2);

  let second = project.path().join("second");
  let report = engine(&project, rule_keys(), &second)
    .with_cache(cache.clone())
    .build(&[t("//app:greet")])
    .await
    .unwrap();
  assert_eq!(report.success_counts().get("fetched"), Some(&2));
  assert_eq!(read(second.join("app/__greet__/greet.txt")), "hello quarry!\n");

  // A different seed never reuses the other seed's entries.
  let third = project.path().join("third");
  let report = engine(&project, RuleKeyConfiguration::new("s2", "test"), &third)
    .with_cache(cache.clone())
    .build(&[])
    .await
    .unwrap();
  assert_eq!(report.success_counts().get("built"), Some(&2));
  assert_eq!(cache.len(), 4);
}

#[cfg(unix)]
#[tokio::test]
async fn failing_step_fails_dependents_with_root_cause() {
  let json = r#"{
    "rules": [
      {"name": "//a:broken", "type": "genrule", "steps": [{"kind": "cmd", "cmd": "echo boom >&2; exit 4"}]},
      {"name": "//a:user", "type": "genrule", "deps": ["//a:broken"]},
      {"name": "//a:fine", "type": "genrule", "steps": [{"kind": "write_file", "path": "ok", "content": "ok"}]}
    ]
  }"#;
  let project = project(json, &[]);
  let out = out_dir(&project);

  let report = engine(&project, rule_keys(), &out).build(&[]).await.unwrap();
  assert!(!report.is_success());
  assert_eq!(report.success_type(&t("//a:fine")), Some(&SuccessType::BuiltLocally));

  match report.outcome(&t("//a:user")) {
    Some(NodeOutcome::Failed(err)) => match err.root_cause() {
      BuildError::StepExecutionFailure {
        target,
        exit_code,
        message,
        ..
      } => {
        assert_eq!(target, &t("//a:broken"));
        assert_eq!(*exit_code, Some(4));
        assert!(message.contains("boom"), "{message}");
      }
      other => panic!("unexpected root cause: {other}"),
    },
    other => panic!("unexpected outcome: {other:?}"),
  }
  assert!(!out.join("a/__broken__").join(quarry_lib::engine::COMPLETE_MARKER).exists());
}

#[tokio::test]
async fn cyclic_build_file_is_rejected() {
  let json = r#"{
    "rules": [
      {"name": "//c:a", "type": "genrule", "deps": ["//c:b"]},
      {"name": "//c:b", "type": "genrule", "deps": ["//c:a"]}
    ]
  }"#;
  let project = project(json, &[]);
  let file = super::common::load(&project);
  let config = quarry_lib::engine::BuildConfig::new(file.project_root(), out_dir(&project));
  let err = quarry_lib::engine::BuildEngine::new(
    Arc::new(file.resolver()),
    config,
    quarry_lib::engine::BuildContext::new(rule_keys()),
  )
  .err()
  .unwrap();
  match err {
    BuildError::CyclicDependency { path } => {
      assert_eq!(path.first(), path.last());
      assert_eq!(path.len(), 3);
    }
    other => panic!("unexpected error: {other}"),
  }
}

#[tokio::test]
async fn package_named_like_a_rule_keeps_both_outputs() {
  let json = r#"{
    "rules": [
      {"name": "//a:b", "type": "genrule", "deps": ["//a/b:c"],
       "steps": [{"kind": "write_file", "path": "b.txt", "content": "outer"}]},
      {"name": "//a/b:c", "type": "genrule",
       "steps": [{"kind": "write_file", "path": "c.txt", "content": "inner"}]}
    ]
  }"#;
  let project = project(json, &[]);
  let out = out_dir(&project);

  let report = engine(&project, rule_keys(), &out).build(&[]).await.unwrap();
  assert_eq!(report.success_counts().get("built"), Some(&2));

  let report = engine(&project, rule_keys(), &out).build(&[]).await.unwrap();
  assert_eq!(report.success_counts().get("matching"), Some(&2));
  assert_eq!(read(out.join("a/__b__/b.txt")), "outer");
  assert_eq!(read(out.join("a/b/__c__/c.txt")), "inner");
}
