//! Colour maps used by the stat-map, surface and chart figures

use std::str::FromStr;

use plotters::style::RGBColor;

use crate::error::FcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colormap {
    /// Cyan-blue for negative, black at zero, red-yellow for positive
    ColdHot,
    RdBu,
    Reds,
    Oranges,
    Binary,
}

const COLD_HOT: &[(f64, [u8; 3])] = &[
    (0.0, [0, 255, 255]),
    (0.25, [0, 0, 255]),
    (0.5, [0, 0, 0]),
    (0.75, [255, 0, 0]),
    (1.0, [255, 255, 0]),
];

const RD_BU: &[(f64, [u8; 3])] = &[
    (0.0, [103, 0, 31]),
    (0.25, [214, 96, 77]),
    (0.5, [247, 247, 247]),
    (0.75, [67, 147, 195]),
    (1.0, [5, 48, 97]),
];

const REDS: &[(f64, [u8; 3])] = &[(0.0, [255, 245, 240]), (0.5, [251, 106, 74]), (1.0, [103, 0, 13])];

const ORANGES: &[(f64, [u8; 3])] = &[(0.0, [255, 245, 235]), (0.5, [253, 141, 60]), (1.0, [127, 39, 4])];

const BINARY: &[(f64, [u8; 3])] = &[(0.0, [255, 255, 255]), (1.0, [0, 0, 0])];

impl Colormap {
    fn anchors(&self) -> &'static [(f64, [u8; 3])] {
        match self {
            Colormap::ColdHot => COLD_HOT,
            Colormap::RdBu => RD_BU,
            Colormap::Reds => REDS,
            Colormap::Oranges => ORANGES,
            Colormap::Binary => BINARY,
        }
    }

    /// Colour at `t` in [0, 1]; values outside are clipped, NaN maps to 0
    pub fn map(&self, t: f64) -> RGBColor {
        let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
        let anchors = self.anchors();
        for w in anchors.windows(2) {
            let (t0, c0) = w[0];
            let (t1, c1) = w[1];
            if t <= t1 {
                let f = if t1 > t0 { (t - t0) / (t1 - t0) } else { 0.0 };
                let lerp = |a: u8, b: u8| (a as f64 + f * (b as f64 - a as f64)).round() as u8;
                return RGBColor(lerp(c0[0], c1[0]), lerp(c0[1], c1[1]), lerp(c0[2], c1[2]));
            }
        }
        let [r, g, b] = anchors[anchors.len() - 1].1;
        RGBColor(r, g, b)
    }

    /// Colour of `value` on the scale `[vmin, vmax]`
    pub fn map_range(&self, value: f64, vmin: f64, vmax: f64) -> RGBColor {
        if vmax <= vmin {
            return self.map(0.5);
        }
        self.map((value - vmin) / (vmax - vmin))
    }
}

impl FromStr for Colormap {
    type Err = FcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cold_hot" => Ok(Colormap::ColdHot),
            "RdBu" | "RdBu_r" => Ok(Colormap::RdBu),
            "Reds" => Ok(Colormap::Reds),
            "Oranges" => Ok(Colormap::Oranges),
            "binary" => Ok(Colormap::Binary),
            other => Err(FcError::Config(format!("unknown colormap {}", other))),
        }
    }
}

/// The handful of matplotlib colour names the figures use
pub fn named_color(name: &str) -> Option<RGBColor> {
    let c = match name {
        "orange" => RGBColor(255, 165, 0),
        "lightslategray" | "lightslategrey" => RGBColor(119, 136, 153),
        "lightgrey" | "lightgray" => RGBColor(211, 211, 211),
        "darkgrey" | "darkgray" => RGBColor(169, 169, 169),
        "white" => RGBColor(255, 255, 255),
        "black" => RGBColor(0, 0, 0),
        "red" => RGBColor(255, 0, 0),
        "blue" => RGBColor(0, 0, 255),
        _ => return None,
    };
    Some(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_and_centre() {
        assert_eq!(Colormap::ColdHot.map(0.5), RGBColor(0, 0, 0));
        assert_eq!(Colormap::ColdHot.map(1.0), RGBColor(255, 255, 0));
        assert_eq!(Colormap::Binary.map(0.0), RGBColor(255, 255, 255));
        assert_eq!(Colormap::Binary.map(2.0), RGBColor(0, 0, 0));
        assert_eq!(Colormap::Binary.map(0.5), RGBColor(128, 128, 128));
    }

    #[test]
    fn test_map_range() {
        assert_eq!(Colormap::Reds.map_range(-4.0, -4.0, 4.0), RGBColor(255, 245, 240));
        assert_eq!(Colormap::Reds.map_range(1.0, 1.0, 1.0), Colormap::Reds.map(0.5));
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("cold_hot".parse::<Colormap>().unwrap(), Colormap::ColdHot);
        assert_eq!("Oranges".parse::<Colormap>().unwrap(), Colormap::Oranges);
        assert!("viridis".parse::<Colormap>().is_err());
        assert_eq!(named_color("orange"), Some(RGBColor(255, 165, 0)));
        assert!(named_color("teal").is_none());
    }
}
