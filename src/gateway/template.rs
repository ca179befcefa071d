//! Template variable expansion shared by the target handlers
//!
//! Recognized variables: `{building_id}`, `{point_name}`, `{value}`,
//! `{timestamp}`, `{date}`, `{year}`, `{month}`, `{day}`, `{hour}`.
//! Unknown placeholders pass through untouched.

use chrono::{DateTime, Utc};

use crate::types::CspAlarmMessage;

/// Values substituted into a template.
#[derive(Debug, Clone)]
pub struct TemplateVars {
    pub building_id: i32,
    pub point_name: String,
    pub value: f64,
    pub time: DateTime<Utc>,
}

impl TemplateVars {
    pub fn from_alarm(alarm: &CspAlarmMessage) -> Self {
        Self {
            building_id: alarm.bd,
            point_name: alarm.nm.clone(),
            value: alarm.vl,
            time: Utc::now(),
        }
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }
}

/// Expand every recognized `{variable}` in `template`.
pub fn expand(template: &str, vars: &TemplateVars) -> String {
    template
        .replace("{building_id}", &vars.building_id.to_string())
        .replace("{point_name}", &vars.point_name)
        .replace("{value}", &vars.value.to_string())
        .replace("{timestamp}", &vars.time.timestamp_millis().to_string())
        .replace("{date}", &vars.time.format("%Y-%m-%d").to_string())
        .replace("{year}", &vars.time.format("%Y").to_string())
        .replace("{month}", &vars.time.format("%m").to_string())
        .replace("{day}", &vars.time.format("%d").to_string())
        .replace("{hour}", &vars.time.format("%H").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> TemplateVars {
        TemplateVars {
            building_id: 101,
            point_name: "boiler_temp".to_string(),
            value: 150.5,
            time: DateTime::<Utc>::from_timestamp(1_705_564_800, 0).unwrap(),
        }
    }

    #[test]
    fn expands_all_variables() {
        let out = expand(
            "{building_id}/{point_name}/{value}@{date} {year}-{month}-{day} {hour}h",
            &vars(),
        );
        assert_eq!(out, "101/boiler_temp/150.5@2024-01-18 2024-01-18 08h");
    }

    #[test]
    fn unknown_placeholders_pass_through() {
        assert_eq!(expand("{unknown}/{point_name}", &vars()), "{unknown}/boiler_temp");
    }

    #[test]
    fn timestamp_is_epoch_millis() {
        assert_eq!(expand("{timestamp}", &vars()), "1705564800000");
    }
}
