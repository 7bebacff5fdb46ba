use serde_json::Value;

pub type JsonMap = serde_json::Map<String, Value>;

/// 按顺序取第一个非空字段；数字按十进制字符串返回（站点的 id 字段时而是数字时而是字符串）。
pub fn pick_string(map: &JsonMap, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| map.get(*key).and_then(scalar_to_string))
}

pub fn scalar_to_string(val: &Value) -> Option<String> {
    match val {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => {
            if let Some(i) = n.as_u64() {
                Some(i.to_string())
            } else if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else {
                n.as_f64().filter(|f| f.is_finite()).map(|f| f.to_string())
            }
        }
        _ => None,
    }
}

/// 取数组字段；字段缺失或不是数组时返回空切片。
pub fn pick_array<'a>(map: &'a JsonMap, key: &str) -> &'a [Value] {
    map.get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_and_strings_are_both_accepted() {
        let v = json!({"a": 42, "b": " 7 ", "c": "", "d": null});
        let map = v.as_object().unwrap();
        assert_eq!(pick_string(map, &["a"]).as_deref(), Some("42"));
        assert_eq!(pick_string(map, &["b"]).as_deref(), Some("7"));
        assert_eq!(pick_string(map, &["c", "d", "a"]).as_deref(), Some("42"));
        assert_eq!(pick_string(map, &["missing"]), None);
    }

    #[test]
    fn pick_array_tolerates_wrong_shape() {
        let v = json!({"chapters": "nope", "list": [1, 2]});
        let map = v.as_object().unwrap();
        assert!(pick_array(map, "chapters").is_empty());
        assert_eq!(pick_array(map, "list").len(), 2);
    }
}
