// Entity Models - Reference data consumed by the engine
//
// Each entity has a stable identifier that snapshots and trends key on:
// - Earthquake: upstream event id
// - Airport: IATA code
// - Country: ISO alpha-2

pub mod earthquake;
pub mod airport;
pub mod country;

pub use earthquake::{AlertLevel, Earthquake};
pub use airport::{Airport, AirportRegistry, AirportType, NO_IATA};
pub use country::{Country, CountryRegistry};
