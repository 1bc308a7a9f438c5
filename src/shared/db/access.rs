use diesel::{
    prelude::*,
    r2d2::{ConnectionManager, PooledConnection},
    result::Error as DieselError,
    sqlite::SqliteConnection,
};

use super::records::{
    AlertRow, AssetRow, ChunkRow, CommandRow, CredentialRow, HourlyRow, OrganizationRow,
    PendingEvaluationRow, ReadingRow, SensorRow,
};
use super::schema::{
    alerts, assets, chunks, commands, connection_credentials, organizations, pending_evaluations,
    readings, readings_hourly, sensors,
};
use crate::shared::errors::{AppError, AppResult};

pub type PooledSqlite = PooledConnection<ConnectionManager<SqliteConnection>>;

/// One pooled connection. Every method is blocking; callers run it through
/// `Store::run`.
pub struct DBAccessManager {
    connection: PooledSqlite,
}

impl DBAccessManager {
    pub fn new(connection: PooledSqlite) -> DBAccessManager {
        DBAccessManager { connection }
    }

    pub fn insert_organization(&mut self, row: &OrganizationRow) -> AppResult<()> {
        diesel::insert_into(organizations::table)
            .values(row)
            .execute(&mut self.connection)
            .map_err(|err| AppError::from_diesel_err(err, "While creating organization:"))?;
        Ok(())
    }

    pub fn load_organizations(&mut self) -> AppResult<Vec<OrganizationRow>> {
        organizations::table
            .select(OrganizationRow::as_select())
            .load(&mut self.connection)
            .map_err(|err| AppError::from_diesel_err(err, "While loading organizations:"))
    }

    pub fn upsert_asset(&mut self, row: &AssetRow) -> AppResult<()> {
        diesel::replace_into(assets::table)
            .values(row)
            .execute(&mut self.connection)
            .map_err(|err| AppError::from_diesel_err(err, "While saving asset:"))?;
        Ok(())
    }

    pub fn load_assets(&mut self) -> AppResult<Vec<AssetRow>> {
        assets::table
            .select(AssetRow::as_select())
            .order(assets::id)
            .load(&mut self.connection)
            .map_err(|err| AppError::from_diesel_err(err, "While loading assets:"))
    }

    pub fn upsert_sensor(&mut self, row: &SensorRow) -> AppResult<()> {
        diesel::replace_into(sensors::table)
            .values(row)
            .execute(&mut self.connection)
            .map_err(|err| AppError::from_diesel_err(err, "While saving sensor:"))?;
        Ok(())
    }

    pub fn load_sensors(&mut self) -> AppResult<Vec<SensorRow>> {
        sensors::table
            .select(SensorRow::as_select())
            .order(sensors::id)
            .load(&mut self.connection)
            .map_err(|err| AppError::from_diesel_err(err, "While loading sensors:"))
    }

    /// Sensors, assets and the organization row itself, in one transaction.
    pub fn delete_registry(&mut self, organization_id: &str) -> AppResult<()> {
        self.connection
            .transaction::<_, DieselError, _>(|conn| {
                diesel::delete(sensors::table.filter(sensors::organization_id.eq(organization_id)))
                    .execute(conn)?;
                diesel::delete(assets::table.filter(assets::organization_id.eq(organization_id)))
                    .execute(conn)?;
                diesel::delete(organizations::table.filter(organizations::id.eq(organization_id)))
                    .execute(conn)?;
                Ok(())
            })
            .map_err(|err| AppError::from_diesel_err(err, "While deleting organization:"))
    }

    /// Rows, their chunk entries and their outbox entries commit together.
    pub fn commit_readings(
        &mut self,
        rows: &[ReadingRow],
        touched: &[ChunkRow],
        pending: &[PendingEvaluationRow],
    ) -> AppResult<()> {
        self.connection
            .transaction::<_, DieselError, _>(|conn| {
                for chunk in touched {
                    diesel::replace_into(chunks::table).values(chunk).execute(conn)?;
                }
                for row in rows {
                    diesel::replace_into(readings::table).values(row).execute(conn)?;
                }
                for entry in pending {
                    diesel::replace_into(pending_evaluations::table)
                        .values(entry)
                        .execute(conn)?;
                }
                Ok(())
            })
            .map_err(|err| AppError::from_diesel_err(err, "While committing readings:"))
    }

    pub fn load_readings(&mut self) -> AppResult<Vec<ReadingRow>> {
        readings::table
            .select(ReadingRow::as_select())
            .order((readings::chunk_start, readings::chunk_partition, readings::timestamp))
            .load(&mut self.connection)
            .map_err(|err| AppError::from_diesel_err(err, "While loading readings:"))
    }

    pub fn load_chunks(&mut self) -> AppResult<Vec<ChunkRow>> {
        chunks::table
            .select(ChunkRow::as_select())
            .load(&mut self.connection)
            .map_err(|err| AppError::from_diesel_err(err, "While loading chunks:"))
    }

    pub fn set_chunk_compressed(&mut self, row: &ChunkRow) -> AppResult<()> {
        diesel::replace_into(chunks::table)
            .values(row)
            .execute(&mut self.connection)
            .map_err(|err| AppError::from_diesel_err(err, "While saving chunk state:"))?;
        Ok(())
    }

    /// Drops a chunk with its rows and any outbox entries pointing into it.
    /// Returns the number of readings removed.
    pub fn delete_chunk(&mut self, chunk_start: i64, chunk_partition: i32) -> AppResult<usize> {
        self.connection
            .transaction::<_, DieselError, _>(|conn| {
                let removed = diesel::delete(
                    readings::table
                        .filter(readings::chunk_start.eq(chunk_start))
                        .filter(readings::chunk_partition.eq(chunk_partition)),
                )
                .execute(conn)?;
                diesel::delete(
                    pending_evaluations::table
                        .filter(pending_evaluations::chunk_start.eq(chunk_start))
                        .filter(pending_evaluations::chunk_partition.eq(chunk_partition)),
                )
                .execute(conn)?;
                diesel::delete(
                    chunks::table
                        .filter(chunks::chunk_start.eq(chunk_start))
                        .filter(chunks::chunk_partition.eq(chunk_partition)),
                )
                .execute(conn)?;
                Ok(removed)
            })
            .map_err(|err| AppError::from_diesel_err(err, "While dropping chunk:"))
    }

    pub fn delete_organization_readings(&mut self, organization_id: &str) -> AppResult<usize> {
        self.connection
            .transaction::<_, DieselError, _>(|conn| {
                let removed =
                    diesel::delete(readings::table.filter(readings::organization_id.eq(organization_id)))
                        .execute(conn)?;
                diesel::delete(
                    pending_evaluations::table
                        .filter(pending_evaluations::organization_id.eq(organization_id)),
                )
                .execute(conn)?;
                Ok(removed)
            })
            .map_err(|err| AppError::from_diesel_err(err, "While purging readings:"))
    }

    pub fn load_pending(&mut self) -> AppResult<Vec<PendingEvaluationRow>> {
        pending_evaluations::table
            .select(PendingEvaluationRow::as_select())
            .order((pending_evaluations::timestamp, pending_evaluations::reading_id))
            .load(&mut self.connection)
            .map_err(|err| AppError::from_diesel_err(err, "While loading pending evaluations:"))
    }

    /// Raised alerts land and their outbox entries leave in one transaction.
    /// An alert already recorded for the same reading is kept as is.
    pub fn record_evaluations(
        &mut self,
        raised: &[AlertRow],
        evaluated: &[(String, i64)],
    ) -> AppResult<()> {
        self.connection
            .transaction::<_, DieselError, _>(|conn| {
                for alert in raised {
                    diesel::insert_or_ignore_into(alerts::table)
                        .values(alert)
                        .execute(conn)?;
                }
                for (org, reading_id) in evaluated {
                    diesel::delete(
                        pending_evaluations::table
                            .filter(pending_evaluations::organization_id.eq(org))
                            .filter(pending_evaluations::reading_id.eq(reading_id)),
                    )
                    .execute(conn)?;
                }
                Ok(())
            })
            .map_err(|err| AppError::from_diesel_err(err, "While recording evaluations:"))
    }

    pub fn upsert_alert(&mut self, row: &AlertRow) -> AppResult<()> {
        diesel::replace_into(alerts::table)
            .values(row)
            .execute(&mut self.connection)
            .map_err(|err| AppError::from_diesel_err(err, "While saving alert:"))?;
        Ok(())
    }

    pub fn load_alerts(&mut self) -> AppResult<Vec<AlertRow>> {
        alerts::table
            .select(AlertRow::as_select())
            .order(alerts::id)
            .load(&mut self.connection)
            .map_err(|err| AppError::from_diesel_err(err, "While loading alerts:"))
    }

    pub fn delete_alerts(&mut self, organization_id: &str) -> AppResult<usize> {
        self.connection
            .transaction::<_, DieselError, _>(|conn| {
                let removed =
                    diesel::delete(alerts::table.filter(alerts::organization_id.eq(organization_id)))
                        .execute(conn)?;
                diesel::delete(
                    pending_evaluations::table
                        .filter(pending_evaluations::organization_id.eq(organization_id)),
                )
                .execute(conn)?;
                Ok(removed)
            })
            .map_err(|err| AppError::from_diesel_err(err, "While deleting alerts:"))
    }

    pub fn upsert_command(&mut self, row: &CommandRow) -> AppResult<()> {
        diesel::replace_into(commands::table)
            .values(row)
            .execute(&mut self.connection)
            .map_err(|err| AppError::from_diesel_err(err, "While saving command:"))?;
        Ok(())
    }

    pub fn load_commands(&mut self) -> AppResult<Vec<CommandRow>> {
        commands::table
            .select(CommandRow::as_select())
            .order(commands::id)
            .load(&mut self.connection)
            .map_err(|err| AppError::from_diesel_err(err, "While loading commands:"))
    }

    pub fn delete_commands(&mut self, organization_id: &str) -> AppResult<usize> {
        diesel::delete(commands::table.filter(commands::organization_id.eq(organization_id)))
            .execute(&mut self.connection)
            .map_err(|err| AppError::from_diesel_err(err, "While deleting commands:"))
    }

    pub fn upsert_credential(&mut self, row: &CredentialRow) -> AppResult<()> {
        diesel::replace_into(connection_credentials::table)
            .values(row)
            .execute(&mut self.connection)
            .map_err(|err| AppError::from_diesel_err(err, "While saving credential:"))?;
        Ok(())
    }

    pub fn delete_credential(&mut self, id: i64) -> AppResult<()> {
        diesel::delete(connection_credentials::table.filter(connection_credentials::id.eq(id)))
            .execute(&mut self.connection)
            .map_err(|err| AppError::from_diesel_err(err, "While deleting credential:"))?;
        Ok(())
    }

    pub fn load_credentials(&mut self) -> AppResult<Vec<CredentialRow>> {
        connection_credentials::table
            .select(CredentialRow::as_select())
            .order(connection_credentials::id)
            .load(&mut self.connection)
            .map_err(|err| AppError::from_diesel_err(err, "While loading credentials:"))
    }

    pub fn delete_credentials(&mut self, organization_id: &str) -> AppResult<usize> {
        diesel::delete(
            connection_credentials::table
                .filter(connection_credentials::organization_id.eq(organization_id)),
        )
        .execute(&mut self.connection)
        .map_err(|err| AppError::from_diesel_err(err, "While deleting credentials:"))
    }

    pub fn upsert_rollup(&mut self, row: &HourlyRow) -> AppResult<()> {
        diesel::replace_into(readings_hourly::table)
            .values(row)
            .execute(&mut self.connection)
            .map_err(|err| AppError::from_diesel_err(err, "While saving rollup:"))?;
        Ok(())
    }

    pub fn delete_rollup(&mut self, organization_id: &str, sensor_id: i64, bucket: &str) -> AppResult<()> {
        diesel::delete(
            readings_hourly::table
                .filter(readings_hourly::organization_id.eq(organization_id))
                .filter(readings_hourly::sensor_id.eq(sensor_id))
                .filter(readings_hourly::bucket.eq(bucket)),
        )
        .execute(&mut self.connection)
        .map_err(|err| AppError::from_diesel_err(err, "While deleting rollup:"))?;
        Ok(())
    }

    pub fn load_rollups(&mut self) -> AppResult<Vec<HourlyRow>> {
        readings_hourly::table
            .select(HourlyRow::as_select())
            .load(&mut self.connection)
            .map_err(|err| AppError::from_diesel_err(err, "While loading rollups:"))
    }

    pub fn delete_rollups(&mut self, organization_id: &str) -> AppResult<usize> {
        diesel::delete(readings_hourly::table.filter(readings_hourly::organization_id.eq(organization_id)))
            .execute(&mut self.connection)
            .map_err(|err| AppError::from_diesel_err(err, "While deleting rollups:"))
    }
}
