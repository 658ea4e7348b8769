use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SentinelError};

/// 调度周期类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleKind {
    Daily,
    Weekly,
    Monthly,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Daily => "DAILY",
            ScheduleKind::Weekly => "WEEKLY",
            ScheduleKind::Monthly => "MONTHLY",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "DAILY" => Ok(ScheduleKind::Daily),
            "WEEKLY" => Ok(ScheduleKind::Weekly),
            "MONTHLY" => Ok(ScheduleKind::Monthly),
            other => Err(SentinelError::custom(format!("未知的调度类型: {other}"))),
        }
    }
}

/// 备份调度定义：周期类型加上对应的选择器（时刻/星期/日）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub kind: ScheduleKind,
    pub time_of_day: NaiveTime,
    pub weekday: Option<Weekday>,
    pub day_of_month: Option<u32>,
}

impl Schedule {
    /// 默认调度：每日 04:00
    pub fn daily_default() -> Self {
        Self::daily(NaiveTime::from_hms_opt(4, 0, 0).unwrap_or(NaiveTime::MIN))
    }

    pub fn daily(time_of_day: NaiveTime) -> Self {
        Self {
            kind: ScheduleKind::Daily,
            time_of_day,
            weekday: None,
            day_of_month: None,
        }
    }

    pub fn weekly(weekday: Weekday, time_of_day: NaiveTime) -> Self {
        Self {
            kind: ScheduleKind::Weekly,
            time_of_day,
            weekday: Some(weekday),
            day_of_month: None,
        }
    }

    pub fn monthly(day_of_month: u32, time_of_day: NaiveTime) -> Self {
        Self {
            kind: ScheduleKind::Monthly,
            time_of_day,
            weekday: None,
            day_of_month: Some(day_of_month),
        }
    }

    /// 计算不晚于 `now` 的最近一次调度触发时刻
    pub fn last_trigger_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive();

        match self.kind {
            ScheduleKind::Daily => {
                let mut candidate = today.and_time(self.time_of_day).and_utc();
                if candidate > now {
                    candidate -= Duration::days(1);
                }
                candidate
            }
            ScheduleKind::Weekly => {
                let target = self.weekday.unwrap_or(Weekday::Mon);
                let back = (today.weekday().num_days_from_monday() + 7
                    - target.num_days_from_monday())
                    % 7;
                let mut candidate = (today - Duration::days(i64::from(back)))
                    .and_time(self.time_of_day)
                    .and_utc();
                if candidate > now {
                    candidate -= Duration::days(7);
                }
                candidate
            }
            ScheduleKind::Monthly => {
                let day = self.day_of_month.unwrap_or(1);
                let candidate =
                    clamped_date(today.year(), today.month(), day).and_time(self.time_of_day);
                if candidate.and_utc() > now {
                    let (year, month) = if today.month() == 1 {
                        (today.year() - 1, 12)
                    } else {
                        (today.year(), today.month() - 1)
                    };
                    clamped_date(year, month, day)
                        .and_time(self.time_of_day)
                        .and_utc()
                } else {
                    candidate.and_utc()
                }
            }
        }
    }

    /// 判断当前是否到期：最近触发时刻已过（含边界），且上次运行早于该时刻。
    /// 纯函数，调度器错过一次tick后会在下一次轮询时补触发。
    pub fn is_due(&self, now: DateTime<Utc>, last_run_at: Option<DateTime<Utc>>) -> bool {
        let trigger_at = self.last_trigger_at(now);
        if now < trigger_at {
            return false;
        }
        match last_run_at {
            None => true,
            Some(last) => last < trigger_at,
        }
    }

    /// "HH:MM" 格式的触发时刻，用于持久化
    pub fn time_of_day_str(&self) -> String {
        self.time_of_day.format("%H:%M").to_string()
    }

    pub fn parse_time_of_day(value: &str) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(value, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
            .map_err(|_| SentinelError::custom(format!("无效的触发时刻: {value}")))
    }

    pub fn weekday_number(&self) -> Option<u32> {
        self.weekday.map(|w| w.num_days_from_monday())
    }

    pub fn weekday_from_number(value: u32) -> Result<Weekday> {
        match value {
            0 => Ok(Weekday::Mon),
            1 => Ok(Weekday::Tue),
            2 => Ok(Weekday::Wed),
            3 => Ok(Weekday::Thu),
            4 => Ok(Weekday::Fri),
            5 => Ok(Weekday::Sat),
            6 => Ok(Weekday::Sun),
            other => Err(SentinelError::custom(format!("无效的星期序号: {other}"))),
        }
    }
}

/// 日序号超出当月天数时收敛到月末
fn clamped_date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or_else(|| {
        let (next_year, next_month) = if month == 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        };
        // 下月首日的前一天即当月末
        NaiveDate::from_ymd_opt(next_year, next_month, 1)
            .unwrap_or_default()
            .pred_opt()
            .unwrap_or_default()
    })
}
