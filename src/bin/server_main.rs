use airelay::{logger, server};

#[tokio::main]
async fn main() {
    std::panic::set_hook(Box::new(|panic_info| {
        let message = match panic_info.payload().downcast_ref::<&str>() {
            Some(s) => s.to_string(),
            None => panic_info
                .payload()
                .downcast_ref::<String>()
                .cloned()
                .unwrap_or_else(|| "unknown panic payload".to_string()),
        };
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());
        logger::error("panic", &format!("{} at {}", message, location));
        eprintln!("FATAL PANIC: {} at {}", message, location);
    }));

    if let Err(e) = server::run().await {
        eprintln!("server exited with error: {}", e);
        std::process::exit(1);
    }
}
