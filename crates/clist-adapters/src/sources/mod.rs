mod atcoder;
mod codechef;
mod codeforces;
mod ctftime;
mod ical;

pub use atcoder::AtCoder;
pub use codechef::CodeChef;
pub use codeforces::Codeforces;
pub use ctftime::CtfTime;
pub use ical::ICalFeed;
