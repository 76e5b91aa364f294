use std::env::args;
use std::str::FromStr;
use std::string::ToString;

use strum::IntoEnumIterator;
use strum_macros::{self, Display, EnumIter, EnumString};

fn main() -> Result<(), String> {
    waitsem::logging::init()?;
    args()
        .nth(1)
        .ok_or(format!(
            "no demo supplied, use one of {} or see unit tests",
            Demo::iter()
                .map(|d| d.to_string())
                .collect::<Vec<String>>()
                .join(",")
        ))
        .and_then(|selector| {
            Demo::from_str(&selector)
                .map(|demo| match demo {
                    Demo::SpinLock => waitsem::spin::run(),
                    Demo::RwSpinLock => waitsem::spin::rw::run(),
                    Demo::WaitQueue => waitsem::wait::run(),
                    Demo::Rwsem => waitsem::rwsem::run(),
                })
                .map_err(|e| e.to_string())
        })
}

#[derive(EnumIter, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
enum Demo {
    SpinLock,
    RwSpinLock,
    WaitQueue,
    Rwsem,
}
