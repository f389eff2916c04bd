//! Renders the pairing code as a scannable QR page.

use {
    base64::{Engine, engine::general_purpose::STANDARD},
    firstcontact_whatsapp::PairingArtifact,
    qrcode::{QrCode, render::svg, types::QrError},
};

pub const NO_PAIRING_TEXT: &str = "Nenhum QR gerado no momento.";

/// Seconds between page reloads, so a superseded code is replaced.
const REFRESH_SECS: u32 = 10;

pub fn render_svg(code: &str) -> Result<String, QrError> {
    let qr = QrCode::new(code.as_bytes())?;
    Ok(qr
        .render::<svg::Color<'_>>()
        .min_dimensions(256, 256)
        .build())
}

pub fn svg_data_url(svg: &str) -> String {
    format!("data:image/svg+xml;base64,{}", STANDARD.encode(svg))
}

/// Full HTML page for `/qr`.
pub fn render_page(artifact: Option<&PairingArtifact>) -> Result<String, QrError> {
    let body = match artifact {
        Some(artifact) => format!(
            r#"<img src="{}" alt="qr-code"/>"#,
            svg_data_url(&render_svg(&artifact.code)?)
        ),
        None => format!("<p>{NO_PAIRING_TEXT}</p>"),
    };
    Ok(format!(
        concat!(
            "<!doctype html><html><head><meta charset=\"utf-8\">",
            "<meta http-equiv=\"refresh\" content=\"{refresh}\">",
            "<title>firstcontact pairing</title></head><body>{body}</body></html>"
        ),
        refresh = REFRESH_SECS,
        body = body,
    ))
}
