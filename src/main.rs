
use std::env;
use std::process;

use cooc_rs::Pipeline;

fn main() {
    let args: Vec<String> = env::args().collect();
    if let Err(e) = Pipeline::run(&args) {
        eprintln!("{}", e);
        process::exit(1);
    }
}
