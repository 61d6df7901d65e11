//! Static enum ↔ wire-token tables.
//!
//! Tor names statuses, purposes and reasons with upper-case tokens
//! (`BUILT`, `HS_CLIENT_REND`, `CONNECTREFUSED`). Every enum that travels on
//! the control port implements [`WireToken`] through the `wire_enum!`
//! macro, which writes the enum and its lookup table side by side so the two
//! can never drift apart.
//!
//! Decoding is case-insensitive and never fails: a token missing from the
//! table decodes to the enum's unknown variant.

/// Bidirectional mapping between an enum and its control-protocol tokens.
pub trait WireToken: Sized + Copy + PartialEq + 'static {
    /// Variant returned for tokens that are not in [`TABLE`](Self::TABLE).
    const UNKNOWN: Self;

    /// Every known variant with its wire token.
    const TABLE: &'static [(Self, &'static str)];

    /// Returns the wire token, or `None` for the unknown variant.
    fn token(self) -> Option<&'static str> {
        Self::TABLE
            .iter()
            .find(|(variant, _)| *variant == self)
            .map(|(_, token)| *token)
    }

    /// Decodes a token, ignoring ASCII case.
    fn from_token(token: &str) -> Self {
        Self::TABLE
            .iter()
            .find(|(_, known)| known.eq_ignore_ascii_case(token))
            .map_or(Self::UNKNOWN, |(variant, _)| *variant)
    }
}

/// A bit in a flag set together with its wire token.
pub type FlagEntry = (u32, &'static str);

/// ORs together every recognised token; unknown tokens are ignored.
pub fn parse_flags<'a>(tokens: impl IntoIterator<Item = &'a str>, table: &[FlagEntry]) -> u32 {
    tokens.into_iter().fold(0, |bits, token| {
        table
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(token.trim()))
            .map_or(bits, |(bit, _)| bits | bit)
    })
}

/// Lists the tokens of every set bit, in table order.
pub fn flag_tokens(bits: u32, table: &[FlagEntry]) -> Vec<&'static str> {
    table
        .iter()
        .filter(|(bit, _)| bits & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Declares an enum whose variants map one-to-one onto wire tokens.
///
/// The first variant is the unknown/absent value and the `Default`.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $(#[$unknown_meta:meta])*
            $unknown:ident,
            $(
                $(#[$variant_meta:meta])*
                $variant:ident => $token:literal
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        $vis enum $name {
            $(#[$unknown_meta])*
            #[default]
            $unknown,
            $(
                $(#[$variant_meta])*
                $variant,
            )+
        }

        impl $crate::wire::WireToken for $name {
            const UNKNOWN: Self = $name::$unknown;
            const TABLE: &'static [(Self, &'static str)] = &[
                $( ($name::$variant, $token), )+
            ];
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let token = <Self as $crate::wire::WireToken>::token(*self);
                f.write_str(token.unwrap_or("UNKNOWN"))
            }
        }
    };
}

pub(crate) use wire_enum;

#[cfg(test)]
mod tests {
    use super::*;

    wire_enum! {
        enum Colour {
            Unknown,
            Red => "RED",
            DarkBlue => "DARK_BLUE",
        }
    }

    const FLAGS: &[FlagEntry] = &[(0x1, "Fast"), (0x2, "Guard"), (0x4, "Exit")];

    #[test]
    fn test_round_trip_tokens() {
        assert_eq!(Colour::from_token("RED"), Colour::Red);
        assert_eq!(Colour::from_token("dark_blue"), Colour::DarkBlue);
        assert_eq!(Colour::DarkBlue.token(), Some("DARK_BLUE"));
        assert_eq!(Colour::DarkBlue.to_string(), "DARK_BLUE");
    }

    #[test]
    fn test_unknown_token() {
        assert_eq!(Colour::from_token("GREEN"), Colour::Unknown);
        assert_eq!(Colour::Unknown.token(), None);
        assert_eq!(Colour::default(), Colour::Unknown);
    }

    #[test]
    fn test_flags() {
        let bits = parse_flags(["fast", "Exit", "Bogus"], FLAGS);
        assert_eq!(bits, 0x5);
        assert_eq!(flag_tokens(bits, FLAGS), vec!["Fast", "Exit"]);
        assert_eq!(parse_flags(std::iter::empty(), FLAGS), 0);
    }
}
