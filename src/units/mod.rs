mod address;
mod amount;

pub use address::Address;
pub use address::InvalidAddress;

pub use amount::TokenAmount;

pub const TOKEN_DECIMALS: u32 = 18;

pub const WEI_PER_TOKEN: u128 = 1_000_000_000_000_000_000;
