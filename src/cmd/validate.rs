//! `pactown validate <config>`: parse and validate an ecosystem file
//! without starting anything.

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
            println!(
                "valid: {} service(s), start order: {}",
                spec.services.len(),
                order.join(" -> ")
            );
            ExitCode::Success
        }
        Err(e) => {
            eprintln!("error: {e}");
            exit_code_for(&e)
        }
    }
}
