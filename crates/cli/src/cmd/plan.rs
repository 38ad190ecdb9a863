//! Implementation of the `quarry plan` command.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use quarry_lib::engine::{ActionGraph, RuleResolver};

use super::load_build_file;
use crate::output::{OutputFormat, print_info, print_json, print_target};

#[derive(Serialize)]
struct PlanWave {
  wave: usize,
  targets: Vec<String>,
}

/// Print the targets wave by wave: every target in a wave only depends on
/// targets of earlier waves.
pub fn cmd_plan(file: &Path, output: OutputFormat) -> Result<()> {
  let build_file = load_build_file(file)?;
  let graph = ActionGraph::new(build_file.resolver().actions())?;

  let waves = graph.waves();

  if output.is_json() {
    let waves: Vec<PlanWave> = waves
      .iter()
      .enumerate()
      .map(|(i, wave)| PlanWave {
        wave: i + 1,
        targets: wave.iter().map(ToString::to_string).collect(),
      })
      .collect();
    return print_json(&waves);
  }

  print_info(&format!("{} targets in {} waves", graph.len(), waves.len()));
  for (i, wave) in waves.iter().enumerate() {
    println!("Wave {}:", i + 1);
    for target in wave {
      let deps = graph
        .dependencies(target)
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
      let detail = if deps.is_empty() {
        String::new()
      } else {
        format!("after {}", deps.join(", "))
      };
      print_target(&target.to_string(), &detail);
    }
  }
  Ok(())
}
