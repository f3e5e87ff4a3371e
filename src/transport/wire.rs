//! 设备线路协议：ASCII 行，`\n` 结尾
//!
//! 下行：原始命令字符串，或 `<name><delimiter><value>`；上行：`<name>:<value>`，value 去掉尾部空白。

use crate::transport::DeviceReply;

/// 编码为一行（去掉调用方自带的换行后补 `\n`）
pub fn encode_line(command: &str) -> String {
    let mut line = command.trim_end_matches(['\r', '\n']).to_string();
    line.push('\n');
    line
}

/// name-value 负载
pub fn join_name_value(name: &str, delimiter: &str, value: &str) -> String {
    format!("{name}{delimiter}{value}")
}

/// 解析上行一行；空行返回 None
pub fn parse_line(raw: &str) -> Option<DeviceReply> {
    let line = raw.trim_end();
    if line.trim_start().is_empty() {
        return None;
    }
    let reply = match line.split_once(':') {
        Some((name, value)) => DeviceReply {
            name: name.trim().to_string(),
            value: value.trim_end().to_string(),
        },
        None => DeviceReply {
            name: String::new(),
            value: line.trim_start().to_string(),
        },
    };
    Some(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_line() {
        assert_eq!(encode_line("M2231 V1"), "M2231 V1\n");
        assert_eq!(encode_line("M2231 V1\r\n"), "M2231 V1\n");
    }

    #[test]
    fn test_join_name_value() {
        assert_eq!(join_name_value("led", ":", "1"), "led:1");
        assert_eq!(join_name_value("M2231 V", "", "1"), "M2231 V1");
    }

    #[test]
    fn test_parse_name_value() {
        let r = parse_line("temp:37 \r\n").unwrap();
        assert_eq!(r.name, "temp");
        assert_eq!(r.value, "37");
    }

    #[test]
    fn test_parse_splits_at_first_colon() {
        let r = parse_line("time:12:30").unwrap();
        assert_eq!(r.name, "time");
        assert_eq!(r.value, "12:30");
    }

    #[test]
    fn test_parse_without_colon() {
        let r = parse_line("ok\n").unwrap();
        assert_eq!(r.name, "");
        assert_eq!(r.value, "ok");
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse_line("  \r\n").is_none());
        assert!(parse_line("").is_none());
    }
}
