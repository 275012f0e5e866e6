//! Medicare card number checks.
//!
//! A card number is 10 digits: an 8-digit identifier starting with 2-6, a
//! check digit, and an issue number. The check digit is the weighted sum of
//! the first 8 digits (weights 1,3,7,9,1,3,7,9) modulo 10.

const MEDICARE_DIGITS: usize = 10;
const CHECKSUM_WEIGHTS: [u32; 8] = [1, 3, 7, 9, 1, 3, 7, 9];

/// Why a Medicare number was rejected. Each kind maps to its own message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MedicareError {
    #[error("Enter {remaining} more digit{}", plural(.remaining))]
    Incomplete { remaining: usize },
    #[error("Medicare numbers have 10 digits")]
    TooManyDigits,
    #[error("Medicare numbers start with 2, 3, 4, 5 or 6")]
    InvalidLeadingDigit,
    #[error("This Medicare number doesn't look right. Check the card and try again")]
    ChecksumMismatch,
}

fn plural(n: &usize) -> &'static str {
    if *n == 1 {
        ""
    } else {
        "s"
    }
}

/// Validate a Medicare number as typed (spaces and separators allowed).
/// Returns the normalized 10-digit string.
pub fn validate_medicare(input: &str) -> Result<String, MedicareError> {
    let digits: Vec<u32> = input.chars().filter_map(|c| c.to_digit(10)).collect();

    if digits.len() < MEDICARE_DIGITS {
        return Err(MedicareError::Incomplete {
            remaining: MEDICARE_DIGITS - digits.len(),
        });
    }
    if digits.len() > MEDICARE_DIGITS {
        return Err(MedicareError::TooManyDigits);
    }
    if !(2..=6).contains(&digits[0]) {
        return Err(MedicareError::InvalidLeadingDigit);
    }

    let checksum: u32 = digits
        .iter()
        .zip(CHECKSUM_WEIGHTS)
        .map(|(d, w)| d * w)
        .sum();
    if checksum % 10 != digits[8] {
        return Err(MedicareError::ChecksumMismatch);
    }

    Ok(digits.iter().map(|d| char::from(b'0' + *d as u8)).collect())
}

/// Individual reference number: the single digit 1-9 beside the patient's name.
pub fn valid_irn(input: &str) -> bool {
    matches!(input.trim().as_bytes(), [b'1'..=b'9'])
}
