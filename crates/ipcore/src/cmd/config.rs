use ipcore_system::CoreConfig;

use crate::cmd::ConfigArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{human_bytes, print_fields, OutputFormat};

pub fn run(args: ConfigArgs, format: OutputFormat, config: CoreConfig) -> CliResult<i32> {
    let config = if args.defaults {
        CoreConfig::default()
    } else {
        config
    };
    print_fields("ipcore config", &config, &config_fields(&config), format);
    Ok(SUCCESS)
}

fn config_fields(config: &CoreConfig) -> Vec<(&'static str, String)> {
    vec![
        (
            "max_message_bytes",
            human_bytes(config.max_message_bytes as u64),
        ),
        ("max_message_handles", config.max_message_handles.to_string()),
        ("max_queued_messages", config.max_queued_messages.to_string()),
        (
            "default_data_pipe_capacity",
            human_bytes(config.default_data_pipe_capacity as u64),
        ),
        (
            "max_data_pipe_capacity",
            human_bytes(config.max_data_pipe_capacity as u64),
        ),
        (
            "max_shared_buffer_size",
            human_bytes(config.max_shared_buffer_size),
        ),
        ("max_handles", config.max_handles.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_cover_every_limit() {
        let config = CoreConfig::default();
        let fields = config_fields(&config);
        let json = serde_json::to_value(&config).unwrap();
        let object = json.as_object().unwrap();

        assert_eq!(fields.len(), object.len());
        for (name, _) in &fields {
            assert!(object.contains_key(*name), "{name} missing from JSON");
        }
    }
}
