use chrono::Utc;
use serde_json::Value;

use crate::devices::ActuatorProfile;
use crate::modbus::TransactionResult;

pub trait ResultFormatter: Send + Sync {
    fn format_result(&self, result: &TransactionResult) -> String;
    fn format_profiles(&self, profiles: &[ActuatorProfile]) -> String;
    fn format_header(&self) -> String;
}

/// Picks a formatter by its CLI name, defaulting to the console one.
pub fn formatter_for(name: &str) -> Box<dyn ResultFormatter> {
    match name {
        "json" => Box::new(JsonFormatter),
        "csv" => Box::new(CsvFormatter),
        "hex" => Box::new(HexFormatter),
        _ => Box::new(ConsoleFormatter),
    }
}

/// Space separated upper-case hex, e.g. `01 06 00 01`.
pub fn spaced_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn registers_list(registers: &[u16]) -> String {
    registers
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct ConsoleFormatter;

impl ResultFormatter for ConsoleFormatter {
    fn format_result(&self, result: &TransactionResult) -> String {
        let mut output = format!("📤 Request  [HEX]: {}\n", spaced_hex(&result.request_frame));

        match &result.response_bytes {
            Some(bytes) if bytes.is_empty() => output.push_str("📥 Response: no data received\n"),
            Some(bytes) => output.push_str(&format!("📥 Response [HEX]: {}\n", spaced_hex(bytes))),
            None => output.push_str("📥 Response: not read\n"),
        }

        if !result.decoded_registers.is_empty() {
            output.push_str(&format!("🔢 Registers: {}\n", registers_list(&result.decoded_registers)));
        }

        match result.error {
            Some(kind) => output.push_str(&format!("❌ Error: {}\n", kind)),
            None => output.push_str("✅ OK\n"),
        }
        output
    }

    fn format_profiles(&self, profiles: &[ActuatorProfile]) -> String {
        let mut output = format!(
            "{:<20} {:>8} {:>8} {:>8} {:>8} {:>8}\n",
            "Actuator", "Register", "Open", "Close", "0%", "100%"
        );
        output.push_str(&"-".repeat(65));
        output.push('\n');

        for profile in profiles {
            output.push_str(&format!(
                "{:<20} {:>#8X} {:>#8X} {:>#8X} {:>8} {:>8}\n",
                profile.name,
                profile.register_address,
                profile.open_raw_value,
                profile.close_raw_value,
                profile.percent_to_raw(0).unwrap_or_default(),
                profile.percent_to_raw(100).unwrap_or_default(),
            ));
        }
        output
    }

    fn format_header(&self) -> String {
        format!("🚀 Valve Modbus - {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

pub struct JsonFormatter;

impl ResultFormatter for JsonFormatter {
    fn format_result(&self, result: &TransactionResult) -> String {
        let mut value = serde_json::to_value(result).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.insert("request_hex".to_string(), Value::String(result.request_hex()));
            map.insert(
                "response_hex".to_string(),
                result.response_hex().map(Value::String).unwrap_or(Value::Null),
            );
        }
        let mut line = serde_json::to_string(&value).unwrap_or_default();
        line.push('\n');
        line
    }

    fn format_profiles(&self, profiles: &[ActuatorProfile]) -> String {
        let mut json = serde_json::to_string_pretty(profiles).unwrap_or_default();
        json.push('\n');
        json
    }

    fn format_header(&self) -> String {
        String::new() // JSON doesn't need headers
    }
}

pub struct CsvFormatter;

impl ResultFormatter for CsvFormatter {
    fn format_result(&self, result: &TransactionResult) -> String {
        format!(
            "{},{},{},{},{}\n",
            result.completed_at.to_rfc3339(),
            result.request_hex(),
            result.response_hex().unwrap_or_default(),
            registers_list(&result.decoded_registers),
            result.error.map(|kind| kind.to_string()).unwrap_or_default()
        )
    }

    fn format_profiles(&self, profiles: &[ActuatorProfile]) -> String {
        let mut csv = String::from("Actuator,Register,Open,Close\n");
        for profile in profiles {
            csv.push_str(&format!(
                "{},{},{},{}\n",
                profile.name, profile.register_address, profile.open_raw_value, profile.close_raw_value
            ));
        }
        csv
    }

    fn format_header(&self) -> String {
        "Timestamp,Request,Response,Registers,Error\n".to_string()
    }
}

/// Raw bytes only, one line per transaction.
pub struct HexFormatter;

impl ResultFormatter for HexFormatter {
    fn format_result(&self, result: &TransactionResult) -> String {
        let response = result
            .response_bytes
            .as_deref()
            .map(spaced_hex)
            .unwrap_or_default();
        format!("{} -> {}\n", spaced_hex(&result.request_frame), response)
    }

    fn format_profiles(&self, profiles: &[ActuatorProfile]) -> String {
        ConsoleFormatter.format_profiles(profiles)
    }

    fn format_header(&self) -> String {
        format!("🔍 Hex Data Output - {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::ActuatorProfileRegistry;
    use crate::utils::error::ErrorKind;

    fn sample() -> TransactionResult {
        let mut result = TransactionResult::new(vec![0x01, 0x03, 0x00, 0x02, 0x00, 0x02, 0x65, 0xCB]);
        result.response_bytes = Some(vec![0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x14, 0xDA, 0x3E]);
        result.decoded_registers = vec![10, 20];
        result
    }

    #[test]
    fn test_console_format() {
        let text = ConsoleFormatter.format_result(&sample());
        assert!(text.contains("01 03 00 02 00 02 65 CB"));
        assert!(text.contains("01 03 04 00 0A 00 14 DA 3E"));
        assert!(text.contains("Registers: 10 20"));
        assert!(text.contains("OK"));
    }

    #[test]
    fn test_console_format_error_and_silence() {
        let mut result = sample();
        result.response_bytes = Some(Vec::new());
        result.decoded_registers.clear();
        result.error = Some(ErrorKind::FrameTooShort);

        let text = ConsoleFormatter.format_result(&result);
        assert!(text.contains("no data received"));
        assert!(text.contains("Error: FrameTooShort"));
    }

    #[test]
    fn test_json_format() {
        let json: Value = serde_json::from_str(&JsonFormatter.format_result(&sample())).unwrap();
        assert_eq!(json["decoded_registers"], serde_json::json!([10, 20]));
        assert_eq!(json["response_hex"], "010304000A0014DA3E");
        assert_eq!(json["error"], Value::Null);
    }

    #[test]
    fn test_csv_and_hex_format() {
        let csv = CsvFormatter.format_result(&sample());
        assert!(csv.ends_with(",01030002000265CB,010304000A0014DA3E,10 20,\n"));

        let hex = HexFormatter.format_result(&sample());
        assert_eq!(hex, "01 03 00 02 00 02 65 CB -> 01 03 04 00 0A 00 14 DA 3E\n");
    }

    #[test]
    fn test_profile_listing() {
        let text = ConsoleFormatter.format_profiles(ActuatorProfileRegistry::profiles());
        assert!(text.contains("TOP-E Module"));
        assert!(text.contains("0xBB7"));

        let json: Value = serde_json::from_str(&JsonFormatter.format_profiles(ActuatorProfileRegistry::profiles())).unwrap();
        assert_eq!(json[2]["name"], "White-E Evolution");
        assert_eq!(json[3]["open_raw_value"], 2999);
    }

    #[test]
    fn test_json_results_are_one_per_line() {
        let mut second = sample();
        second.decoded_registers = vec![30, 40];

        let output = JsonFormatter.format_header()
            + &JsonFormatter.format_result(&sample())
            + &JsonFormatter.format_result(&second);
        assert!(output.ends_with('\n'));

        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        for (line, registers) in lines.iter().zip([[10, 20], [30, 40]]) {
            let json: Value = serde_json::from_str(line).unwrap();
            assert_eq!(json["decoded_registers"], serde_json::json!(registers));
        }
        assert!(JsonFormatter.format_profiles(ActuatorProfileRegistry::profiles()).ends_with("]\n"));
    }

    #[test]
    fn test_formatter_for() {
        assert!(formatter_for("json").format_header().is_empty());
        assert!(formatter_for("csv").format_header().starts_with("Timestamp"));
    }
}
