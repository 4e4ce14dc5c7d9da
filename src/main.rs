/// Entry point for the gemini-relay server binary
#[tokio::main]
async fn main() {
    // Log panics through stderr before exiting so a supervisor sees them
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("gemini-relay panic: {:?}", panic_info);
        std::process::exit(1);
    }));

    if let Err(e) = gemini_relay::run().await {
        eprintln!("gemini-relay failed: {:#}", e);
        std::process::exit(1);
    }
}
