/// Mean Earth radius used for great-circle distance.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres between two (lat, lon) points in degrees.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_york_to_london() {
        let d = haversine_km(40.7128, -74.0060, 51.5074, -0.1278);
        assert!((d - 5570.0).abs() < 15.0, "got {d}");
    }

    #[test]
    fn test_zero_distance() {
        assert_eq!(haversine_km(35.0, 139.0, 35.0, 139.0), 0.0);
    }

    #[test]
    fn test_symmetric() {
        let a = haversine_km(-33.86, 151.2, 1.35, 103.8);
        let b = haversine_km(1.35, 103.8, -33.86, 151.2);
        assert!((a - b).abs() < 1e-9);
    }
}
