pub fn init() {
    if let Ok(directives) = ::std::env::var("RUST_LOG") {
        println!("Logging enabled with directives: {directives}",);
        init_with_directives(&directives);
    } else {
        println!("Logging disabled");
    }
}

pub fn init_with_directives(directives: &str) {
    // try_init so that test binaries can call this once per test
    pretty_env_logger::formatted_timed_builder()
        .parse_filters(directives)
        .format_timestamp_millis()
        .try_init()
        .ok();
}
