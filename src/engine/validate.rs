use crate::limits::*;
use crate::model::SpotDetails;

use super::EngineError;

fn required(field: &'static str, value: &str, max_len: usize) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::invalid(field, "is required"));
    }
    if value.len() > max_len {
        return Err(EngineError::invalid(field, format!("must be at most {max_len} characters")));
    }
    Ok(())
}

pub(crate) fn spot_details(d: &SpotDetails) -> Result<(), EngineError> {
    required("address", &d.address, MAX_FIELD_LEN)?;
    required("city", &d.city, MAX_FIELD_LEN)?;
    required("state", &d.state, MAX_FIELD_LEN)?;
    required("country", &d.country, MAX_FIELD_LEN)?;
    if !(-90.0..=90.0).contains(&d.lat) {
        return Err(EngineError::invalid("lat", "latitude must be within -90 and 90"));
    }
    if !(-180.0..=180.0).contains(&d.lng) {
        return Err(EngineError::invalid("lng", "longitude must be within -180 and 180"));
    }
    if d.name.trim().is_empty() || d.name.chars().count() > MAX_SPOT_NAME_LEN {
        return Err(EngineError::invalid("name", "name must be less than 50 characters"));
    }
    required("description", &d.description, MAX_TEXT_LEN)?;
    if !d.price.is_finite() || d.price <= 0.0 {
        return Err(EngineError::invalid("price", "price per day must be a positive number"));
    }
    Ok(())
}

pub(crate) fn review(text: &str, stars: i64) -> Result<u8, EngineError> {
    required("review", text, MAX_TEXT_LEN)?;
    let stars = u8::try_from(stars)
        .ok()
        .filter(|s| (MIN_STARS..=MAX_STARS).contains(s))
        .ok_or_else(|| EngineError::invalid("stars", "stars must be an integer from 1 to 5"))?;
    Ok(stars)
}

pub(crate) fn url(value: &str) -> Result<(), EngineError> {
    required("url", value, MAX_URL_LEN)
}

pub(crate) fn signup(
    username: &str,
    email: &str,
    first_name: &str,
    last_name: &str,
    password: &str,
) -> Result<(), EngineError> {
    if !email.contains('@') || email.len() > MAX_FIELD_LEN {
        return Err(EngineError::invalid("email", "invalid email"));
    }
    let len = username.chars().count();
    if !(MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&len) {
        return Err(EngineError::invalid(
            "username",
            format!("username must be {MIN_USERNAME_LEN} to {MAX_USERNAME_LEN} characters"),
        ));
    }
    if username.contains('@') {
        return Err(EngineError::invalid("username", "username cannot be an email"));
    }
    required("first_name", first_name, MAX_FIELD_LEN)?;
    required("last_name", last_name, MAX_FIELD_LEN)?;
    if password.len() < MIN_PASSWORD_LEN {
        return Err(EngineError::invalid(
            "password",
            format!("password must be at least {MIN_PASSWORD_LEN} characters"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details() -> SpotDetails {
        SpotDetails {
            address: "123 Disney Lane".into(),
            city: "San Francisco".into(),
            state: "California".into(),
            country: "United States of America".into(),
            lat: 37.76,
            lng: -122.47,
            name: "App Academy".into(),
            description: "Place where web developers are created".into(),
            price: 123.0,
        }
    }

    fn field_of(r: Result<(), EngineError>) -> &'static str {
        match r {
            Err(EngineError::Validation { field, .. }) => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn valid_spot_passes() {
        assert!(spot_details(&details()).is_ok());
    }

    #[test]
    fn spot_field_errors_name_the_field() {
        let mut d = details();
        d.city = "  ".into();
        assert_eq!(field_of(spot_details(&d)), "city");

        let mut d = details();
        d.lat = 90.5;
        assert_eq!(field_of(spot_details(&d)), "lat");

        let mut d = details();
        d.lng = -181.0;
        assert_eq!(field_of(spot_details(&d)), "lng");

        let mut d = details();
        d.name = "x".repeat(50);
        assert_eq!(field_of(spot_details(&d)), "name");

        let mut d = details();
        d.price = 0.0;
        assert_eq!(field_of(spot_details(&d)), "price");

        let mut d = details();
        d.price = f64::NAN;
        assert_eq!(field_of(spot_details(&d)), "price");
    }

    #[test]
    fn stars_range() {
        assert_eq!(review("Great", 1).unwrap(), 1);
        assert_eq!(review("Great", 5).unwrap(), 5);
        assert!(review("Great", 0).is_err());
        assert!(review("Great", 6).is_err());
        assert!(review("Great", -3).is_err());
        assert!(review("", 4).is_err());
    }

    #[test]
    fn signup_rules() {
        assert!(signup("demo-lition", "demo@user.io", "Demo", "Lition", "password").is_ok());
        assert_eq!(field_of(signup("abc", "a@b.c", "A", "B", "password")), "username");
        assert_eq!(field_of(signup("me@x.io", "a@b.c", "A", "B", "password")), "username");
        assert_eq!(field_of(signup("someone", "nope", "A", "B", "password")), "email");
        assert_eq!(field_of(signup("someone", "a@b.c", "", "B", "password")), "first_name");
        assert_eq!(field_of(signup("someone", "a@b.c", "A", "B", "short")), "password");
    }
}
