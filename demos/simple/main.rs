use featuregate::{Client, ClientOptions, User};

pub fn main() -> featuregate::Result<()> {
    // Configure env_logger to see SDK logs.
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("featuregate")).init();

    let sdk_key = std::env::var("FEATUREGATE_SDK_KEY")
        .expect("FEATUREGATE_SDK_KEY env variable should contain a server secret key");
    let client = Client::new(sdk_key, ClientOptions::new().environment("development"))?;

    // Block waiting for the first sync. Until specs arrive, every gate evaluates to false.
    if let Err(err) = client.initialize() {
        println!("error requesting specs: {:?}", err);
    }

    let user = User::with_user_id("test-user").with_custom("plan", "pro");

    let gate = client.get_feature_gate(&user, "a_feature_gate");
    println!("Gate: {} ({:?})", gate.value, gate.details.reason);

    let layer = client.get_layer(&user, "a_layer");
    let color: String = layer.get("button_color", "gray".to_owned());
    println!("Layer parameter: {color}");

    client.log_event(&user, "demo_finished", None, None);

    // Flushes queued exposures and events.
    client.shutdown()
}
