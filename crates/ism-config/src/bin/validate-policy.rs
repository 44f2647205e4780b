//! Policy validation CLI tool
//!
//! Validates one or more policy JSON files and reports any errors.

use ism_config::{ActionKind, Condition, ConfigError, Policy};
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let paths: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();

    if paths.is_empty() {
        eprintln!("Usage: validate-policy <policy.json>...");
        eprintln!();
        eprintln!("Validates ismd policy documents. The policy id is taken from the file name.");
        eprintln!();
        eprintln!("Example:");
        eprintln!("  validate-policy policies/hot-delete.json");
        return ExitCode::from(2);
    }

    let now = ism_util::now();
    let mut failed = false;

    for path in &paths {
        match ism_config::load_policy(path, now) {
            Ok(policy) => {
                println!("✓ {} is valid", path.display());
                print_summary(&policy);
            }
            Err(e) => {
                failed = true;
                eprintln!("✗ {} failed validation", path.display());
                match &e {
                    ConfigError::ReadError(io_err) => {
                        eprintln!("  Failed to read file: {}", io_err);
                    }
                    ConfigError::JsonError(parse_err) => {
                        eprintln!("  JSON parse error: {}", parse_err);
                    }
                    ConfigError::ValidationFailed { errors } => {
                        eprintln!("  Validation errors ({}):", errors.len());
                        for err in errors {
                            eprintln!("    - {}", err);
                        }
                    }
                    ConfigError::UnsupportedVersion(ver) => {
                        eprintln!(
                            "  Unsupported schema version: {} (expected {})",
                            ver,
                            ism_config::CURRENT_POLICY_SCHEMA_VERSION
                        );
                    }
                    ConfigError::ParseError(parse_err) => {
                        eprintln!("  Parse error: {}", parse_err);
                    }
                }
            }
        }
        println!();
    }

    if failed {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

fn print_summary(policy: &Policy) {
    println!("  Policy: {}", policy.policy_id);
    println!("  Default state: {}", policy.default_state);

    for state in &policy.states {
        let actions: Vec<String> = state.actions.iter().map(describe_action).collect();
        println!("  - {} [{}]", state.name, actions.join(", "));
        for transition in &state.transitions {
            let condition = match &transition.condition {
                None => "always".to_string(),
                Some(Condition::MinIndexAge(age)) => format!("index age >= {}", age),
                Some(Condition::MinDocCount(count)) => format!("doc count >= {}", count),
                Some(Condition::MinSize(size)) => format!("size >= {}", size),
                Some(Condition::MinRolloverAge(age)) => format!("rollover age >= {}", age),
                Some(Condition::Script(script)) => format!("script ({})", script.lang),
            };
            println!("      -> {} when {}", transition.state_name, condition);
        }
    }

    for template in &policy.ism_templates {
        println!(
            "  Template: {} (priority {})",
            template.index_patterns.join(", "),
            template.priority
        );
    }
}

fn describe_action(action: &ism_config::ActionConfig) -> String {
    match &action.kind {
        ActionKind::ForceMerge(p) => format!("force_merge({})", p.max_num_segments),
        ActionKind::ReplicaCount(p) => format!("replica_count({})", p.number_of_replicas),
        ActionKind::IndexPriority(p) => format!("index_priority({})", p.priority),
        ActionKind::Snapshot(p) => format!("snapshot({})", p.repository),
        other => other.name().to_string(),
    }
}
