use std::process;

use cliagg::aggregation::{self, CliConfig};

fn main() {
    let matches = aggregation::build_app().get_matches();
    let config = match CliConfig::from_arg_matches(&matches) {
        Ok(trial_config) => trial_config,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    };

    if let Err(err) = aggregation::run(config) {
        eprintln!("{}", err);
        process::exit(1);
    }
}
