//! 内置 PGN 定义
//!
//! 常用发动机 / 变速箱参数组。比例与偏移均可在配置中覆盖，
//! 覆盖项需通过参考帧校验（见 `busview-driver` 的配置模块）。

use crate::codec::{FieldDef, FieldWidth, PgnDefinition};

pub const PGN_ENGINE_HOURS: u32 = 65253;
pub const PGN_ENGINE_TEMPERATURE: u32 = 65262;
pub const PGN_ENGINE_FLUIDS: u32 = 65263;
pub const PGN_FUEL_ECONOMY: u32 = 65266;
pub const PGN_TRANSMISSION_FLUIDS: u32 = 65272;
pub const PGN_DASH_DISPLAY: u32 = 65276;
pub const PGN_EEC2: u32 = 61443;

const TEMP_LSB: f64 = 1.0 / 32.0;

pub fn definitions() -> Vec<PgnDefinition> {
    use FieldWidth::*;

    vec![
        PgnDefinition {
            pgn: PGN_ENGINE_HOURS,
            can_id_hex: "18FEE500".into(),
            name: "Engine Hours".into(),
            fields: vec![FieldDef::new("hours", "Engine Hours", "h", Four, 0, 0.05, 0.0)],
        },
        PgnDefinition {
            pgn: PGN_ENGINE_TEMPERATURE,
            can_id_hex: "18FEEE00".into(),
            name: "Temps".into(),
            fields: vec![
                FieldDef::new("cool", "Coolant Temp", "°C", One, 0, 1.0, 40.0),
                FieldDef::new("fuel_temp", "Fuel Temp", "°C", One, 1, 1.0, 40.0),
                FieldDef::new("oil_temp", "Oil Temp", "°C", Two, 2, TEMP_LSB, 273.0),
            ],
        },
        PgnDefinition {
            pgn: PGN_ENGINE_FLUIDS,
            can_id_hex: "18FEEF00".into(),
            name: "Engine Fluids".into(),
            fields: vec![
                FieldDef::new("fuel_press", "Fuel Delivery Pressure", "kPa", One, 0, 4.0, 0.0),
                FieldDef::new("oil_press", "Engine Oil Pressure", "kPa", One, 3, 4.0, 0.0),
                FieldDef::new("cool_press", "Coolant Pressure", "kPa", One, 6, 2.0, 0.0),
                FieldDef::new("cool_level", "Coolant Level", "%", One, 7, 0.4, 0.0),
            ],
        },
        PgnDefinition {
            pgn: PGN_FUEL_ECONOMY,
            can_id_hex: "18FEF200".into(),
            name: "Fuel Economy".into(),
            fields: vec![
                FieldDef::new("fuel_rate", "Fuel Rate", "L/h", Two, 0, 0.05, 0.0),
                FieldDef::new("avg_fuel_econ", "Avg Fuel Economy", "km/L", Two, 4, 1.0 / 512.0, 0.0),
            ],
        },
        PgnDefinition {
            pgn: PGN_TRANSMISSION_FLUIDS,
            can_id_hex: "18FEF800".into(),
            name: "Transmission Fluids".into(),
            fields: vec![
                FieldDef::new("trans_oil_press", "Trans Oil Pressure", "kPa", One, 3, 16.0, 0.0),
                FieldDef::new("trans_oil_temp", "Trans Oil Temp", "°C", Two, 4, TEMP_LSB, 273.0),
            ],
        },
        PgnDefinition {
            pgn: PGN_DASH_DISPLAY,
            can_id_hex: "18FEFC00".into(),
            name: "Dash Display".into(),
            fields: vec![FieldDef::new("fuel_level", "Fuel Level", "%", One, 1, 0.4, 0.0)],
        },
        PgnDefinition {
            pgn: PGN_EEC2,
            can_id_hex: "0CF00300".into(),
            name: "EEC2".into(),
            fields: vec![FieldDef::new("engine_load", "Engine Load", "%", One, 2, 1.0, 0.0)],
        },
    ]
}
