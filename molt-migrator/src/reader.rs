//! The wire-protocol adapter: registers as a replica and decodes row events
//! into the engine's [`BinlogReader`] seam.

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::StreamExt;
use molt::binlog::entry::DmlKind;
use molt::binlog::reader::{BinlogReader, RowImage, RowsEvent};
use molt::error::{ErrorKind, MoltError, MoltResult};
use molt::sql::ColumnValue;
use molt_mysql::{BinlogCoordinates, MySqlConnectionConfig};
use mysql_async::binlog::events::{EventData, RowsEventData};
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, Opts, OptsBuilder, Row, Value};
use tracing::debug;

/// Streams the binary log over the replication protocol via a dedicated
/// connection registered with the given server id.
pub struct MySqlBinlogReader {
    config: MySqlConnectionConfig,
    server_id: u32,
    stream: Option<BinlogStream>,
    current_file: String,
    current_pos: u64,
}

impl MySqlBinlogReader {
    pub fn new(config: MySqlConnectionConfig, server_id: u32) -> Self {
        MySqlBinlogReader {
            config,
            server_id,
            stream: None,
            current_file: String::new(),
            current_pos: 0,
        }
    }

    fn opts(&self) -> Opts {
        let mut builder = OptsBuilder::default()
            .ip_or_hostname(self.config.host.clone())
            .tcp_port(self.config.port)
            .user(Some(self.config.username.clone()));
        if let Some(password) = &self.config.password {
            builder = builder.pass(Some(password.clone()));
        }
        builder.into()
    }
}

fn stream_error(err: impl std::error::Error + Send + Sync + 'static) -> MoltError {
    MoltError::with_source(ErrorKind::BinlogStreamFailed, err)
}

fn convert_value(value: Value) -> ColumnValue {
    match value {
        Value::NULL => ColumnValue::Null,
        Value::Int(v) => ColumnValue::Int(v),
        Value::UInt(v) => ColumnValue::UInt(v),
        Value::Float(v) => ColumnValue::Float(v as f64),
        Value::Double(v) => ColumnValue::Float(v),
        Value::Bytes(bytes) => ColumnValue::Bytes(bytes),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            match NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32).and_then(|d| {
                d.and_hms_micro_opt(hour as u32, minute as u32, second as u32, micros)
            }) {
                Some(datetime) => ColumnValue::DateTime(datetime),
                None => ColumnValue::Null,
            }
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if negative { "-" } else { "" };
            ColumnValue::Text(format!(
                "{sign}{:02}:{:02}:{:02}.{:06}",
                u32::from(hours) + days * 24,
                minutes,
                seconds,
                micros
            ))
        }
    }
}

fn convert_row(row: Row) -> Vec<ColumnValue> {
    row.unwrap().into_iter().map(convert_value).collect()
}

#[async_trait]
impl BinlogReader for MySqlBinlogReader {
    async fn connect(&mut self, coordinates: &BinlogCoordinates) -> MoltResult<()> {
        if let Some(stream) = self.stream.take() {
            let _ = stream.close().await;
        }

        let BinlogCoordinates::File { log_file, log_pos } = coordinates else {
            return Err(MoltError::other(
                "the replication adapter only resumes from file coordinates",
            ));
        };

        let conn = Conn::new(self.opts()).await.map_err(stream_error)?;

        let mut request = BinlogStreamRequest::new(self.server_id);
        if !log_file.is_empty() {
            request = request.with_filename(log_file.as_bytes()).with_pos(*log_pos);
        }

        let stream = conn.get_binlog_stream(request).await.map_err(stream_error)?;
        self.stream = Some(stream);
        self.current_file = log_file.clone();
        self.current_pos = *log_pos;
        debug!(coordinates = %coordinates, server_id = self.server_id, "binlog stream connected");
        Ok(())
    }

    async fn next_event(&mut self) -> MoltResult<Option<RowsEvent>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| MoltError::other("binlog reader is not connected"))?;

        loop {
            let Some(event) = stream.next().await else {
                return Ok(None);
            };
            let event = event.map_err(stream_error)?;
            let end_log_pos = u64::from(event.header().log_pos());

            let Some(data) = event.read_data().map_err(stream_error)? else {
                self.current_pos = end_log_pos;
                continue;
            };

            match data {
                EventData::RotateEvent(rotate) => {
                    self.current_file =
                        String::from_utf8_lossy(rotate.name_raw()).into_owned();
                    self.current_pos = rotate.position();
                }
                EventData::RowsEvent(rows_data) => {
                    let kind = match &rows_data {
                        RowsEventData::WriteRowsEvent(_) | RowsEventData::WriteRowsEventV1(_) => {
                            DmlKind::Insert
                        }
                        RowsEventData::UpdateRowsEvent(_)
                        | RowsEventData::UpdateRowsEventV1(_) => DmlKind::Update,
                        RowsEventData::DeleteRowsEvent(_)
                        | RowsEventData::DeleteRowsEventV1(_) => DmlKind::Delete,
                        _ => {
                            self.current_pos = end_log_pos;
                            continue;
                        }
                    };

                    let Some(tme) = stream.get_tme(rows_data.table_id()) else {
                        self.current_pos = end_log_pos;
                        continue;
                    };

                    let mut images = Vec::new();
                    for row in rows_data.rows(tme) {
                        let (before, after) = row.map_err(stream_error)?;
                        let where_values = before
                            .map(|row| Row::try_from(row).map(convert_row))
                            .transpose()
                            .map_err(stream_error)?;
                        let new_values = after
                            .map(|row| Row::try_from(row).map(convert_row))
                            .transpose()
                            .map_err(stream_error)?;
                        images.push(RowImage {
                            where_values,
                            new_values,
                        });
                    }

                    let database = tme.database_name().into_owned();
                    let table = tme.table_name().into_owned();
                    self.current_pos = end_log_pos;

                    return Ok(Some(RowsEvent {
                        database,
                        table,
                        kind,
                        rows: images,
                        coordinates: BinlogCoordinates::file(
                            self.current_file.clone(),
                            end_log_pos,
                        ),
                        end_log_pos,
                    }));
                }
                _ => {
                    self.current_pos = end_log_pos;
                }
            }
        }
    }

    fn current_coordinates(&self) -> BinlogCoordinates {
        BinlogCoordinates::file(self.current_file.clone(), self.current_pos)
    }
}
