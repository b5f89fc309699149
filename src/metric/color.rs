use crate::tracklet::LabColor;

/// CIEDE2000 color difference between two CIELAB colors.
///
/// This is the single canonical implementation used everywhere a ΔE is needed -
/// outfit scoring and journey summaries must agree bit-for-bit. Internals run in
/// f64; the formulation follows Sharma, Wu & Dalal (2005) including the G
/// compensation, the hue rotation term, and the discontinuity handling around
/// the 0°/360° seam.
///
pub fn ciede2000(c1: &LabColor, c2: &LabColor) -> f32 {
    let (l1, a1, b1) = (c1.l as f64, c1.a as f64, c1.b as f64);
    let (l2, a2, b2) = (c2.l as f64, c2.a as f64, c2.b as f64);

    let chroma1 = (a1 * a1 + b1 * b1).sqrt();
    let chroma2 = (a2 * a2 + b2 * b2).sqrt();
    let chroma_mean = (chroma1 + chroma2) / 2.0;

    let g = 0.5 * (1.0 - (chroma_mean.powi(7) / (chroma_mean.powi(7) + 25.0_f64.powi(7))).sqrt());
    let a1p = (1.0 + g) * a1;
    let a2p = (1.0 + g) * a2;

    let c1p = (a1p * a1p + b1 * b1).sqrt();
    let c2p = (a2p * a2p + b2 * b2).sqrt();

    let h1p = hue_deg(b1, a1p);
    let h2p = hue_deg(b2, a2p);

    let dl = l2 - l1;
    let dc = c2p - c1p;

    let dh = if c1p * c2p == 0.0 {
        0.0
    } else {
        let diff = h2p - h1p;
        if diff.abs() <= 180.0 {
            diff
        } else if diff > 180.0 {
            diff - 360.0
        } else {
            diff + 360.0
        }
    };
    let dh_big = 2.0 * (c1p * c2p).sqrt() * (dh.to_radians() / 2.0).sin();

    let l_mean = (l1 + l2) / 2.0;
    let cp_mean = (c1p + c2p) / 2.0;

    let h_mean = if c1p * c2p == 0.0 {
        h1p + h2p
    } else if (h1p - h2p).abs() <= 180.0 {
        (h1p + h2p) / 2.0
    } else if h1p + h2p < 360.0 {
        (h1p + h2p + 360.0) / 2.0
    } else {
        (h1p + h2p - 360.0) / 2.0
    };

    let t = 1.0 - 0.17 * (h_mean - 30.0).to_radians().cos()
        + 0.24 * (2.0 * h_mean).to_radians().cos()
        + 0.32 * (3.0 * h_mean + 6.0).to_radians().cos()
        - 0.20 * (4.0 * h_mean - 63.0).to_radians().cos();

    let dtheta = 30.0 * (-((h_mean - 275.0) / 25.0).powi(2)).exp();
    let rc = 2.0 * (cp_mean.powi(7) / (cp_mean.powi(7) + 25.0_f64.powi(7))).sqrt();
    let rt = -(2.0 * dtheta).to_radians().sin() * rc;

    let sl = 1.0 + 0.015 * (l_mean - 50.0).powi(2) / (20.0 + (l_mean - 50.0).powi(2)).sqrt();
    let sc = 1.0 + 0.045 * cp_mean;
    let sh = 1.0 + 0.015 * cp_mean * t;

    let term_l = dl / sl;
    let term_c = dc / sc;
    let term_h = dh_big / sh;

    ((term_l * term_l + term_c * term_c + term_h * term_h + rt * term_c * term_h).sqrt()) as f32
}

fn hue_deg(b: f64, ap: f64) -> f64 {
    if b == 0.0 && ap == 0.0 {
        return 0.0;
    }
    let h = b.atan2(ap).to_degrees();
    if h < 0.0 {
        h + 360.0
    } else {
        h
    }
}
