//! Rendering of QR pairing codes for operators.

use image::{ImageBuffer, Luma};
use qrcode::{Color, EcLevel, QrCode};
use wagate_core::error::GatewayError;

/// Pixels per QR module in PNG output.
const MODULE_PX: u32 = 10;
/// Light modules around the code, per side.
const QUIET_ZONE: u32 = 2;

fn encode(qr_data: &str) -> Result<QrCode, GatewayError> {
    QrCode::with_error_correction_level(qr_data.as_bytes(), EcLevel::L)
        .map_err(|e| GatewayError::Internal(format!("QR generation failed: {e}")))
}

/// Compact terminal rendering: two module rows per text line using
/// Unicode half blocks.
pub fn generate_qr_terminal(qr_data: &str) -> Result<String, GatewayError> {
    let code = encode(qr_data)?;
    let width = code.width();
    let colors = code.into_colors();
    let dark = |row: usize, col: usize| row < width && colors[row * width + col] == Color::Dark;

    let mut out = String::with_capacity((width + 1) * width.div_ceil(2));
    for row in (0..width).step_by(2) {
        for col in 0..width {
            out.push(match (dark(row, col), dark(row + 1, col)) {
                (true, true) => '█',
                (true, false) => '▀',
                (false, true) => '▄',
                (false, false) => ' ',
            });
        }
        out.push('\n');
    }
    Ok(out)
}

/// PNG bytes of the code, black on white with a quiet zone.
pub fn generate_qr_image(qr_data: &str) -> Result<Vec<u8>, GatewayError> {
    let code = encode(qr_data)?;
    let modules = code.width() as u32;
    let side = (modules + QUIET_ZONE * 2) * MODULE_PX;

    let img = ImageBuffer::from_fn(side, side, |x, y| {
        let (mx, my) = (x / MODULE_PX, y / MODULE_PX);
        let inside = (QUIET_ZONE..QUIET_ZONE + modules).contains(&mx)
            && (QUIET_ZONE..QUIET_ZONE + modules).contains(&my);
        if inside
            && code[((mx - QUIET_ZONE) as usize, (my - QUIET_ZONE) as usize)] == Color::Dark
        {
            Luma([0u8])
        } else {
            Luma([255u8])
        }
    });

    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png)
        .map_err(|e| GatewayError::Internal(format!("PNG encoding failed: {e}")))?;
    Ok(buf.into_inner())
}
