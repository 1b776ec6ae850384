// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Renders `log_date_format` patterns such as `YYYY-MM-DD HH:mm:ss Z`.
//! Text inside square brackets is emitted verbatim.

use time::{OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    YearFull,
    YearShort,
    MonthPadded,
    Month,
    DayPadded,
    Day,
    HourPadded,
    Hour,
    Hour12Padded,
    Hour12,
    MinutePadded,
    Minute,
    SecondPadded,
    Second,
    Millis,
    Centis,
    Decis,
    OffsetColon,
    Offset,
    MeridiemUpper,
    MeridiemLower,
    UnixSeconds,
    UnixMillis,
}

/// Longest tokens first so `YYYY` wins over `YY`.
const TOKENS: &[(&str, Field)] = &[
    ("YYYY", Field::YearFull),
    ("SSS", Field::Millis),
    ("YY", Field::YearShort),
    ("MM", Field::MonthPadded),
    ("DD", Field::DayPadded),
    ("HH", Field::HourPadded),
    ("hh", Field::Hour12Padded),
    ("mm", Field::MinutePadded),
    ("ss", Field::SecondPadded),
    ("SS", Field::Centis),
    ("ZZ", Field::Offset),
    ("M", Field::Month),
    ("D", Field::Day),
    ("H", Field::Hour),
    ("h", Field::Hour12),
    ("m", Field::Minute),
    ("s", Field::Second),
    ("S", Field::Decis),
    ("Z", Field::OffsetColon),
    ("A", Field::MeridiemUpper),
    ("a", Field::MeridiemLower),
    ("X", Field::UnixSeconds),
    ("x", Field::UnixMillis),
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Item {
    Literal(String),
    Field(Field),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampFormat {
    items: Vec<Item>,
}

impl TimestampFormat {
    pub fn parse(pattern: &str) -> Self {
        let mut items = Vec::new();
        let mut literal = String::new();
        let mut rest = pattern;

        while let Some(c) = rest.chars().next() {
            if c == '['
                && let Some(end) = rest.find(']')
            {
                literal.push_str(&rest[1..end]);
                rest = &rest[end + 1..];
                continue;
            }
            if let Some((token, field)) = TOKENS.iter().find(|(t, _)| rest.starts_with(t)) {
                if !literal.is_empty() {
                    items.push(Item::Literal(std::mem::take(&mut literal)));
                }
                items.push(Item::Field(*field));
                rest = &rest[token.len()..];
                continue;
            }
            literal.push(c);
            rest = &rest[c.len_utf8()..];
        }
        if !literal.is_empty() {
            items.push(Item::Literal(literal));
        }
        Self { items }
    }

    pub fn render(&self, at: OffsetDateTime) -> String {
        let mut out = String::with_capacity(32);
        for item in &self.items {
            match item {
                Item::Literal(s) => out.push_str(s),
                Item::Field(field) => render_field(&mut out, *field, at),
            }
        }
        out
    }

    /// Render the current time in the local offset, or UTC when the local
    /// offset cannot be determined.
    pub fn render_now(&self) -> String {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        self.render(now)
    }
}

fn render_field(out: &mut String, field: Field, at: OffsetDateTime) {
    use std::fmt::Write;

    let hour12 = match at.hour() % 12 {
        0 => 12,
        h => h,
    };
    // Writing to a String cannot fail.
    let _ = match field {
        Field::YearFull => write!(out, "{:04}", at.year()),
        Field::YearShort => write!(out, "{:02}", at.year().rem_euclid(100)),
        Field::MonthPadded => write!(out, "{:02}", u8::from(at.month())),
        Field::Month => write!(out, "{}", u8::from(at.month())),
        Field::DayPadded => write!(out, "{:02}", at.day()),
        Field::Day => write!(out, "{}", at.day()),
        Field::HourPadded => write!(out, "{:02}", at.hour()),
        Field::Hour => write!(out, "{}", at.hour()),
        Field::Hour12Padded => write!(out, "{hour12:02}"),
        Field::Hour12 => write!(out, "{hour12}"),
        Field::MinutePadded => write!(out, "{:02}", at.minute()),
        Field::Minute => write!(out, "{}", at.minute()),
        Field::SecondPadded => write!(out, "{:02}", at.second()),
        Field::Second => write!(out, "{}", at.second()),
        Field::Millis => write!(out, "{:03}", at.millisecond()),
        Field::Centis => write!(out, "{:02}", at.millisecond() / 10),
        Field::Decis => write!(out, "{}", at.millisecond() / 100),
        Field::OffsetColon => write_offset(out, at.offset(), ":"),
        Field::Offset => write_offset(out, at.offset(), ""),
        Field::MeridiemUpper => out.write_str(if at.hour() < 12 { "AM" } else { "PM" }),
        Field::MeridiemLower => out.write_str(if at.hour() < 12 { "am" } else { "pm" }),
        Field::UnixSeconds => write!(out, "{}", at.unix_timestamp()),
        Field::UnixMillis => write!(out, "{}", at.unix_timestamp_nanos() / 1_000_000),
    };
}

fn write_offset(out: &mut String, offset: UtcOffset, sep: &str) -> std::fmt::Result {
    use std::fmt::Write;

    let (h, m, _) = offset.as_hms();
    let sign = if offset.is_negative() { '-' } else { '+' };
    write!(out, "{sign}{:02}{sep}{:02}", h.unsigned_abs(), m.unsigned_abs())
}
