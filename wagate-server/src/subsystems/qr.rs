//! Pairing QR rendering: raw payload → `data:image/svg+xml;base64,...`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use qrcode::render::svg;
use qrcode::QrCode;

pub const DATA_URL_PREFIX: &str = "data:image/svg+xml;base64,";

const MIN_DIMENSION: u32 = 264;

pub fn render_data_url(payload: &str) -> Result<String, qrcode::types::QrError> {
    let code = QrCode::new(payload.as_bytes())?;
    let image = code
        .render::<svg::Color>()
        .min_dimensions(MIN_DIMENSION, MIN_DIMENSION)
        .quiet_zone(true)
        .build();
    Ok(format!("{}{}", DATA_URL_PREFIX, STANDARD.encode(image.as_bytes())))
}
