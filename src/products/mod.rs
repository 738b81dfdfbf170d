// Product wrappers: vehicles, powerwall batteries and solar installations
use crate::error::{Result, TeslaError};
use crate::session::Tesla;
use serde_json::{Map, Value};
use std::time::{Duration, Instant};

const COMPOSITOR_URL: &str = "https://static-assets.tesla.com/v1/compositor/";

/// Stringify a product identifier that may arrive as a JSON string or
/// number.
fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn pretty(raw: &Map<String, Value>) -> String {
    serde_json::to_string_pretty(&Value::Object(raw.clone())).unwrap_or_default()
}

/// A vehicle on the account. Fields other than the identity key are a cache
/// of the last successful fetch and may be stale; call `get_vehicle_data`
/// or `get_vehicle_summary` to refresh them — no field access performs I/O.
pub struct Vehicle<'a> {
    tesla: &'a Tesla,
    id: String,
    raw: Map<String, Value>,
}

impl<'a> Vehicle<'a> {
    pub fn new(tesla: &'a Tesla, raw: Map<String, Value>) -> Result<Self> {
        let id = id_string(raw.get("id_s"))
            .ok_or_else(|| TeslaError::Config("Vehicle without id_s field".to_string()))?;
        Ok(Self { tesla, id, raw })
    }

    /// The immutable vehicle identifier used in endpoint paths.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    pub fn raw(&self) -> &Map<String, Value> {
        &self.raw
    }

    pub fn display_name(&self) -> &str {
        self.raw
            .get("display_name")
            .and_then(Value::as_str)
            .unwrap_or(&self.id)
    }

    pub fn state(&self) -> Option<&str> {
        self.raw.get("state").and_then(Value::as_str)
    }

    pub fn vin(&self) -> Option<&str> {
        self.raw.get("vin").and_then(Value::as_str)
    }

    /// Pretty-printed JSON of the cached fields.
    pub fn to_json_string(&self) -> String {
        pretty(&self.raw)
    }

    /// Endpoint request with the `vehicle_id` path variable filled in.
    pub fn api(&self, name: &str, params: Option<Value>) -> Result<Value> {
        self.tesla.api(name, &[("vehicle_id", &self.id)], params)
    }

    /// Command endpoint request with the `vehicle_id` path variable filled
    /// in; unwraps the command envelope.
    pub fn command(&self, name: &str, params: Option<Value>) -> Result<bool> {
        self.tesla.command(name, &[("vehicle_id", &self.id)], params)
    }

    fn merge_response(&mut self, data: Value) {
        if let Some(Value::Object(fields)) = data.get("response").cloned() {
            for (key, value) in fields {
                // The identity key never changes after construction.
                if key != "id_s" {
                    self.raw.insert(key, value);
                }
            }
        }
    }

    /// State of the vehicle's various sub-systems.
    pub fn get_vehicle_summary(&mut self) -> Result<&mut Self> {
        let data = self.api("VEHICLE_SUMMARY", None)?;
        self.merge_response(data);
        Ok(self)
    }

    /// A rollup of all data request endpoints plus vehicle config.
    pub fn get_vehicle_data(&mut self) -> Result<&mut Self> {
        let data = self.api("VEHICLE_DATA", None)?;
        self.merge_response(data);
        Ok(self)
    }

    /// Wake the vehicle if needed and wait for it to come online, polling
    /// with exponential backoff until `timeout` elapses.
    pub fn sync_wake_up(&mut self, timeout: Duration, interval: Duration, backoff: f64) -> Result<()> {
        tracing::info!("{} is {}", self.display_name(), self.state().unwrap_or("unknown"));
        if self.state() == Some("online") {
            return Ok(());
        }
        self.api("WAKE_UP", None)?;
        let start = Instant::now();
        let mut interval = interval;
        while self.state() != Some("online") {
            tracing::debug!("Waiting for {:?}", interval);
            std::thread::sleep(interval);
            self.get_vehicle_summary()?;
            if start.elapsed() > timeout {
                return Err(TeslaError::Command(format!(
                    "{} not woken up within {}s",
                    self.display_name(),
                    timeout.as_secs()
                )));
            }
            interval = interval.mul_f64(backoff);
        }
        tracing::info!("{} is {}", self.display_name(), self.state().unwrap_or("unknown"));
        Ok(())
    }

    /// Titles of the known option codes on this vehicle.
    pub fn option_code_list(&self) -> Vec<String> {
        let codes = self.tesla.option_codes();
        self.raw
            .get("option_codes")
            .and_then(Value::as_str)
            .unwrap_or("")
            .split(',')
            .filter_map(|code| codes.get(code).cloned())
            .collect()
    }

    /// Whether the Mobile Access setting is enabled in the car.
    pub fn mobile_enabled(&self) -> Result<bool> {
        let data = self.api("MOBILE_ENABLED", None)?;
        Ok(data.get("response").and_then(Value::as_bool).unwrap_or(false))
    }

    /// Nearby operated charging stations.
    pub fn get_nearby_charging_sites(&self) -> Result<Value> {
        let data = self.api("NEARBY_CHARGING_SITES", None)?;
        Ok(data.get("response").cloned().unwrap_or(Value::Null))
    }

    /// PNG-formatted composed vehicle image from the compositor. Valid views
    /// are STUD_3QTR, STUD_SEAT, STUD_SIDE, STUD_REAR and STUD_WHEEL.
    pub fn compose_image(&self, view: &str, size: u32) -> Result<Vec<u8>> {
        let vin = self
            .vin()
            .ok_or_else(|| TeslaError::Config("Vehicle has no VIN".to_string()))?;
        let model = vin
            .chars()
            .nth(3)
            .map(|c| format!("m{}", c.to_ascii_lowercase()))
            .ok_or_else(|| TeslaError::Config("Vehicle has a malformed VIN".to_string()))?;
        let options = self
            .raw
            .get("option_codes")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        self.tesla.get_bytes(
            COMPOSITOR_URL,
            &[
                ("model", model),
                ("bkba_opt", "1".to_string()),
                ("view", view.to_string()),
                ("size", size.to_string()),
                ("options", options),
            ],
        )
    }

    /// Decode the VIN positions into manufacturer, body, battery, drive
    /// unit, year and plant.
    pub fn decode_vin(&self) -> Result<Value> {
        let vin = self
            .vin()
            .ok_or_else(|| TeslaError::Config("Vehicle has no VIN".to_string()))?;
        decode_vin(vin)
    }
}

/// Decode a 17-character VIN.
pub fn decode_vin(vin: &str) -> Result<Value> {
    let chars: Vec<char> = vin.chars().collect();
    if chars.len() != 17 {
        return Err(TeslaError::Config(format!(
            "VIN must be 17 characters, got {}",
            chars.len()
        )));
    }
    let make = format!("Model {}", chars[3]);
    let body = match chars[4] {
        'A' => "Hatchback 5 Dr / LHD",
        'B' => "Hatchback 5 Dr / RHD",
        'C' => "MPV / 5 Dr / LHD",
        'D' => "MPV / 5 Dr / RHD",
        'E' => "Sedan 4 Dr / LHD",
        'F' => "Sedan 4 Dr / RHD",
        'G' => "MPV / 5 Dr / LHD",
        _ => "Unknown",
    };
    let battery = match chars[6] {
        'E' => "Electric",
        'H' => "High Capacity",
        'S' => "Standard Capacity",
        'V' => "Ultra Capacity",
        _ => "Unknown",
    };
    let drive_unit = match chars[7] {
        '1' | 'A' => "Single Motor",
        '2' | 'B' => "Dual Motor",
        '3' => "Performance Single Motor",
        '4' | 'F' => "Performance Dual Motor",
        'C' => "Base, Tier 2",
        'G' => "Base, Tier 4",
        'N' => "Base, Tier 7",
        'P' => "Performance, Tier 7",
        _ => "Unknown",
    };
    let year = "9ABCDEFGHJKLMNPRSTVWXY12345678"
        .find(chars[9])
        .map(|index| 2009 + index)
        .ok_or_else(|| TeslaError::Config(format!("Invalid VIN year code {}", chars[9])))?;
    let plant = match chars[10] {
        'B' => "Berlin, Germany",
        'C' => "Shanghai, China",
        'F' => "Fremont, CA, USA",
        'P' => "Palo Alto, CA, USA",
        _ => "Unknown",
    };
    Ok(serde_json::json!({
        "manufacturer": "Tesla Motors, Inc.",
        "make": make,
        "body_type": body,
        "battery_type": battery,
        "drive_unit": drive_unit,
        "year": year.to_string(),
        "plant_code": plant,
    }))
}

/// A powerwall battery product. Commands address the owning energy site,
/// status reads address the battery itself.
pub struct Battery<'a> {
    tesla: &'a Tesla,
    battery_id: String,
    site_id: String,
    raw: Map<String, Value>,
}

impl<'a> Battery<'a> {
    pub fn new(tesla: &'a Tesla, raw: Map<String, Value>) -> Result<Self> {
        let battery_id = id_string(raw.get("id"))
            .ok_or_else(|| TeslaError::Config("Battery without id field".to_string()))?;
        let site_id = id_string(raw.get("energy_site_id"))
            .ok_or_else(|| TeslaError::Config("Battery without energy_site_id field".to_string()))?;
        Ok(Self {
            tesla,
            battery_id,
            site_id,
            raw,
        })
    }

    pub fn battery_id(&self) -> &str {
        &self.battery_id
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    pub fn to_json_string(&self) -> String {
        pretty(&self.raw)
    }

    /// Endpoint request with both battery and site path variables filled in.
    pub fn api(&self, name: &str, params: Option<Value>) -> Result<Value> {
        self.tesla.api(
            name,
            &[("battery_id", &self.battery_id), ("site_id", &self.site_id)],
            params,
        )
    }

    /// State and details of the battery.
    pub fn get_battery_data(&mut self) -> Result<&mut Self> {
        let data = self.api("BATTERY_DATA", None)?;
        if let Some(Value::Object(fields)) = data.get("response").cloned() {
            for (key, value) in fields {
                if key != "id" && key != "energy_site_id" {
                    self.raw.insert(key, value);
                }
            }
        }
        Ok(self)
    }

    /// Set battery operation to self_consumption, backup or autonomous.
    pub fn set_operation(&self, mode: &str) -> Result<()> {
        let data = self.api(
            "BATTERY_OPERATION_MODE",
            Some(serde_json::json!({ "default_real_mode": mode })),
        )?;
        check_site_response(&data, &format!("set operation mode {}", mode))
    }

    /// Set the minimum backup reserve percent for this battery.
    pub fn set_backup_reserve_percent(&self, percent: u8) -> Result<()> {
        let data = self.api(
            "BACKUP_RESERVE",
            Some(serde_json::json!({ "backup_reserve_percent": percent })),
        )?;
        check_site_response(&data, &format!("set backup reserve percent {}", percent))
    }
}

/// Energy site endpoints report success as `{response: {code: 201}}`.
fn check_site_response(data: &Value, action: &str) -> Result<()> {
    let response = &data["response"];
    if response["code"].as_i64() == Some(201) {
        return Ok(());
    }
    Err(TeslaError::Command(format!(
        "Unable to {}, code: {}, error: {}",
        action,
        response["code"].as_i64().map_or("Unknown".to_string(), |c| c.to_string()),
        response["message"].as_str().unwrap_or("Unknown"),
    )))
}

/// A solar installation product.
pub struct SolarPanel<'a> {
    tesla: &'a Tesla,
    site_id: String,
    raw: Map<String, Value>,
}

impl<'a> SolarPanel<'a> {
    pub fn new(tesla: &'a Tesla, raw: Map<String, Value>) -> Result<Self> {
        let site_id = id_string(raw.get("energy_site_id")).ok_or_else(|| {
            TeslaError::Config("Solar panel without energy_site_id field".to_string())
        })?;
        Ok(Self {
            tesla,
            site_id,
            raw,
        })
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    pub fn to_json_string(&self) -> String {
        pretty(&self.raw)
    }

    pub fn api(&self, name: &str, params: Option<Value>) -> Result<Value> {
        self.tesla.api(name, &[("site_id", &self.site_id)], params)
    }

    /// Live generation and grid state of the site.
    pub fn get_site_data(&mut self) -> Result<&mut Self> {
        let data = self.api("SITE_DATA", None)?;
        if let Some(Value::Object(fields)) = data.get("response").cloned() {
            for (key, value) in fields {
                if key != "energy_site_id" {
                    self.raw.insert(key, value);
                }
            }
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_vin_model_s() {
        let decoded = decode_vin("5YJSA1E26HF000337").unwrap();
        assert_eq!(decoded["make"], "Model S");
        assert_eq!(decoded["body_type"], "Sedan 4 Dr / LHD");
        assert_eq!(decoded["battery_type"], "Electric");
        assert_eq!(decoded["drive_unit"], "Dual Motor");
        assert_eq!(decoded["year"], "2017");
        assert_eq!(decoded["plant_code"], "Fremont, CA, USA");
    }

    #[test]
    fn test_decode_vin_rejects_wrong_length() {
        let err = decode_vin("5YJSA1E26").unwrap_err();
        assert!(matches!(err, TeslaError::Config(_)));
    }

    #[test]
    fn test_decode_vin_unknown_positions() {
        let decoded = decode_vin("5YJ3Z1EZ1KF000001").unwrap();
        assert_eq!(decoded["make"], "Model 3");
        assert_eq!(decoded["body_type"], "Unknown");
        assert_eq!(decoded["year"], "2019");
    }

    #[test]
    fn test_id_string_handles_numbers_and_strings() {
        assert_eq!(id_string(Some(&json!("abc"))), Some("abc".to_string()));
        assert_eq!(
            id_string(Some(&json!(12345678901234_i64))),
            Some("12345678901234".to_string())
        );
        assert_eq!(id_string(Some(&json!(["x"]))), None);
        assert_eq!(id_string(None), None);
    }

    #[test]
    fn test_check_site_response() {
        let ok = json!({"response": {"code": 201}});
        assert!(check_site_response(&ok, "set operation mode backup").is_ok());

        let failed = json!({"response": {"code": 409, "message": "conflict"}});
        let err = check_site_response(&failed, "set operation mode backup").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("409"));
        assert!(message.contains("conflict"));
    }
}
