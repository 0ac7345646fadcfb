//! Command line program for running `netcall` balancers and workers.

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;

pub mod cli;
pub mod demo;
mod util;

use colored::*;

fn main() {
    // Run the program based on user input
    match cli::start(cli::app_matches()) {
        Ok(_) => (),
        Err(e) => {
            println!("{}{}", "error: ".red(), e);
            if e.root_cause().to_string() != e.to_string() {
                println!("Caused by:\n{}", e.root_cause())
            }
            std::process::exit(1);
        }
    }
}
