pub(crate) mod clock;
pub(crate) mod instant;
pub(crate) mod timestamper;

pub(crate) use clock::Clock;
pub(crate) use instant::Instant;
pub(crate) use timestamper::Timestamper;

#[cfg(test)]
pub(crate) use clock::Mock;
