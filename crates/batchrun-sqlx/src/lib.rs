pub use batchrun_core;
pub use sqlx::PgPool;

mod queries;

pub mod store;

pub use store::{Error, ErrorKind, PgOperationStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PgDateTime(pub std::time::SystemTime);

impl sqlx::Type<sqlx::Postgres> for PgDateTime {
    fn type_info() -> <sqlx::Postgres as sqlx::Database>::TypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("timestamptz")
    }
}

const OUT_OF_RANGE_MESSAGE: &str = "timestamp out of range for PostgreSQL i64 micros";

impl PgDateTime {
    /// Microseconds relative to the PostgreSQL epoch; negative before it.
    fn to_pg_micros(self) -> Result<i64, sqlx::error::BoxDynError> {
        let micros = match self.0.duration_since(postgres_epoch()) {
            Ok(d) => i64::try_from(d.as_micros()).map_err(|_| OUT_OF_RANGE_MESSAGE)?,
            Err(e) => i64::try_from(e.duration().as_micros())
                .map(|v| -v)
                .map_err(|_| OUT_OF_RANGE_MESSAGE)?,
        };
        Ok(micros)
    }

    fn from_pg_micros(micros: i64) -> Result<Self, sqlx::error::BoxDynError> {
        let offset = std::time::Duration::from_micros(micros.unsigned_abs());
        let time = if micros >= 0 {
            postgres_epoch().checked_add(offset)
        } else {
            postgres_epoch().checked_sub(offset)
        };
        time.map(PgDateTime).ok_or_else(|| OUT_OF_RANGE_MESSAGE.into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for PgDateTime {
    fn encode_by_ref(
        &self,
        buf: &mut <sqlx::Postgres as sqlx::Database>::ArgumentBuffer<'q>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        sqlx::Encode::<sqlx::Postgres>::encode(self.to_pg_micros()?, buf)
    }

    fn size_hint(&self) -> usize {
        std::mem::size_of::<i64>()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for PgDateTime {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        match value.format() {
            sqlx::postgres::PgValueFormat::Binary => {
                let micros = <i64 as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
                Self::from_pg_micros(micros)
            }
            sqlx::postgres::PgValueFormat::Text => {
                Err("timestamptz in text format is not supported".into())
            }
        }
    }
}

/// Seconds between the UNIX epoch and `2000-01-01 00:00:00 UTC`, the origin
/// PostgreSQL counts `timestamptz` microseconds from.
const POSTGRESQL_EPOCH_DURATION: std::time::Duration = std::time::Duration::from_secs(946684800);

fn postgres_epoch() -> std::time::SystemTime {
    std::time::SystemTime::UNIX_EPOCH + POSTGRESQL_EPOCH_DURATION
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use super::*;

    #[test]
    fn postgres_epoch_is_zero_micros() {
        assert_eq!(PgDateTime(postgres_epoch()).to_pg_micros().unwrap(), 0);
        assert_eq!(PgDateTime::from_pg_micros(0).unwrap().0, postgres_epoch());
    }

    #[test]
    fn unix_epoch_is_negative() {
        let micros = PgDateTime(UNIX_EPOCH).to_pg_micros().unwrap();
        assert_eq!(micros, -946_684_800_000_000);
        assert_eq!(PgDateTime::from_pg_micros(micros).unwrap().0, UNIX_EPOCH);
    }

    #[test]
    fn micros_survive_conversion() {
        let at = postgres_epoch() + Duration::from_micros(812_345_678_901_234);
        let micros = PgDateTime(at).to_pg_micros().unwrap();
        assert_eq!(micros, 812_345_678_901_234);
        assert_eq!(PgDateTime::from_pg_micros(micros).unwrap().0, at);
    }

    #[test]
    fn sub_micro_precision_is_truncated() {
        let at = postgres_epoch() + Duration::from_nanos(1_999);
        assert_eq!(PgDateTime(at).to_pg_micros().unwrap(), 1);
        assert!(PgDateTime(SystemTime::now()).to_pg_micros().unwrap() > 0);
    }
}
