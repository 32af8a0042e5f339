use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "grid-meter-bridge",
    about = "Grid meter service fed by Home Assistant sensor states over MQTT"
)]
pub struct Config {
    /// MQTT broker hostname
    pub host: String,

    /// MQTT broker port
    #[arg(long, default_value_t = 1883)]
    pub mqtt_port: u16,

    /// MQTT client ID
    #[arg(long, default_value = "dbus-mqtt-meter")]
    pub mqtt_client_id: String,

    /// Topic prefix of the sensor state topics
    #[arg(long, default_value = "hass/sensor")]
    pub topic_prefix: String,

    /// Base service name of the meter service
    #[arg(long, default_value = "com.victronenergy.grid")]
    pub servicebase: String,

    /// Device instance number of the meter service
    #[arg(long, default_value_t = 40)]
    pub device_instance: u32,

    /// Topic prefix under which service paths are published (if omitted, values are only logged)
    #[arg(long)]
    pub export_prefix: Option<String>,

    /// Delay before retrying after a broker connection error, in seconds
    #[arg(long, default_value_t = 5)]
    pub reconnect_secs: u64,
}
