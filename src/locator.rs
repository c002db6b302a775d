//! Block locators are opaque ASCII tokens of the form
//! `<hex-hash>+<size>[+<hints>...]`.  The hash before the first `+`
//! uniquely and verifiably identifies the block's contents; the decimal
//! size hint tells us how many bytes a fully cached copy must hold.
//! Every process sharing a cache directory must parse locators the same
//! way, since the hash prefix determines on-disk paths.
use crate::error::{Error, Result};

/// A borrowed view of a locator string.
#[derive(Clone, Copy, Debug)]
pub struct Locator<'a> {
    raw: &'a str,
}

impl<'a> Locator<'a> {
    pub fn new(raw: &str) -> Locator {
        Locator { raw }
    }

    /// Returns the canonical hash: the prefix before the first `+`, or
    /// the whole token if there is none.
    pub fn hash(&self) -> &'a str {
        match self.raw.find('+') {
            Some(i) if i > 0 => &self.raw[..i],
            _ => self.raw,
        }
    }

    /// Returns the block size from the locator's size hint.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidLocator`] if the size hint is missing
    /// or is not a non-negative 32-bit decimal value.
    pub fn size(&self) -> Result<u64> {
        let rest = match self.raw.find('+') {
            Some(i) if i + 1 < self.raw.len() => &self.raw[i + 1..],
            _ => return Err(Error::InvalidLocator("no size hint")),
        };

        let sizestr = match rest.find('+') {
            Some(i) if i > 0 => &rest[..i],
            Some(_) => return Err(Error::InvalidLocator("invalid size hint")),
            None => rest,
        };

        // Block sizes fit in 32 bits; anything wider is corrupt.
        match sizestr.parse::<u32>() {
            Ok(size) => Ok(size as u64),
            Err(_) => Err(Error::InvalidLocator("invalid size hint")),
        }
    }
}

/// The hash is everything before the first `+`.
#[test]
fn test_hash() {
    assert_eq!(
        Locator::new("acbd18db4cc2f85cedef654fccc4a4d8+3").hash(),
        "acbd18db4cc2f85cedef654fccc4a4d8"
    );
    assert_eq!(
        Locator::new("acbd18db4cc2f85cedef654fccc4a4d8+3+Af00d@1234").hash(),
        "acbd18db4cc2f85cedef654fccc4a4d8"
    );
    // No size hint: the whole token is the hash.
    assert_eq!(Locator::new("acbd18db").hash(), "acbd18db");
}

/// The size hint is the decimal segment between the first two `+`s.
#[test]
fn test_size() {
    assert_eq!(
        Locator::new("acbd18db4cc2f85cedef654fccc4a4d8+3")
            .size()
            .expect("size hint must parse"),
        3
    );
    assert_eq!(
        Locator::new("acbd18db4cc2f85cedef654fccc4a4d8+67108864+Af00d@1234")
            .size()
            .expect("size hint must parse"),
        67108864
    );
}

/// Missing or malformed size hints are invalid-locator errors.
#[test]
fn test_bad_size() {
    for raw in [
        "acbd18db4cc2f85cedef654fccc4a4d8",
        "acbd18db4cc2f85cedef654fccc4a4d8+",
        "acbd18db4cc2f85cedef654fccc4a4d8+-3",
        "acbd18db4cc2f85cedef654fccc4a4d8+three",
        "acbd18db4cc2f85cedef654fccc4a4d8+99999999999999",
        "acbd18db4cc2f85cedef654fccc4a4d8++hint",
    ] {
        assert!(
            matches!(Locator::new(raw).size(), Err(Error::InvalidLocator(_))),
            "{} should not parse",
            raw
        );
    }
}
