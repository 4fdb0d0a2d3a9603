pub fn main() -> appflags::Result<()> {
    // Configure env_logger to see AppFlags SDK logs.
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("appflags")).init();

    let sdk_key = std::env::var("APPFLAGS_SDK_KEY")
        .expect("APPFLAGS_SDK_KEY env variable should contain the SDK key");
    let module_path = std::env::var("APPFLAGS_BUCKETING_MODULE")
        .expect("APPFLAGS_BUCKETING_MODULE env variable should point to the bucketing module");
    let bucketing_module = std::fs::read(module_path)?;

    // Performs the initial configuration fetch; flags are evaluable as soon
    // as this returns.
    let client = appflags::ClientConfig::from_sdk_key(sdk_key, bucketing_module).to_client()?;

    client.on_configuration_change(|| {
        println!("Configuration changed");
    })?;

    // Get a flag value for test-user.
    let user = appflags::AppFlagsUser::new("test-user");
    let enabled = client.get_boolean_variation("a-boolean-flag", &user, false);

    println!("Flag: {:?}", enabled);

    client.close()
}
