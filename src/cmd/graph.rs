//! `pactown graph <config>`: print the resolved dependency start order.

use pactown::resolver::DependencyResolver;
use pactown::EcosystemSpec;

use super::{exit_code_for, ExitCode};

pub fn run(config: &str) -> ExitCode {
    let spec = match EcosystemSpec::load(config) {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("error: {e}");
            return exit_code_for(&e);
        }
    };

    match DependencyResolver::resolve(&spec) {
        Ok(order) => {
            for (i, name) in order.iter().enumerate() {
                let service = &spec.services[name];
                let deps: Vec<&str> = service
                    .depends_on
                    .iter()
                    .map(|d| d.name.as_str())
                    .collect();
                if deps.is_empty() {
                    println!("{}. {name}", i + 1);
                } else {
                    println!("{}. {name} (depends on: {})", i + 1, deps.join(", "));
                }
            }
            ExitCode::Success
        }
        Err(e) => {
            eprintln!("error: {e}");
            exit_code_for(&e)
        }
    }
}
