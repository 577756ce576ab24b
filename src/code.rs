use rand::Rng;

use crate::error::{Error, Result};

/// Builds the human-speakable code for a freshly allocated nameplate.
///
/// The pin is the only entropy that feeds the key exchange, so it must come
/// from a cryptographic RNG; a guessable pin would let an active attacker
/// complete the handshake in the real peer's place.
pub fn generate_code(nameplate: &str) -> String {
    let pin: u32 = rand::thread_rng().gen_range(100_000..=999_999);
    format!("{nameplate}-{pin}")
}

/// Splits a code into `(nameplate, pin)`, validating its shape.
pub fn parse_code(code: &str) -> Result<(&str, &str)> {
    let (nameplate, pin) = code
        .split_once('-')
        .ok_or_else(|| Error::Protocol(format!("invalid code format: {code:?}")))?;

    let well_formed = !nameplate.is_empty()
        && nameplate.chars().all(|c| c.is_ascii_digit())
        && pin.len() == 6
        && pin.chars().all(|c| c.is_ascii_digit());

    if !well_formed {
        return Err(Error::Protocol(format!("invalid code format: {code:?}")));
    }

    Ok((nameplate, pin))
}
