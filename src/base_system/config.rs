//! 配置文件读写：首次运行生成带注释的 `config.yml`，之后以默认值为底合并用户配置。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_yaml::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid yaml at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldMeta {
    pub name: &'static str,
    pub description: &'static str,
}

pub trait ConfigSpec: Serialize + DeserializeOwned + Default {
    const FILE_NAME: &'static str;
    fn fields() -> &'static [FieldMeta];

    /// 合并完成后的取值校验，默认不做限制。
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

/// 读取 `base_dir/FILE_NAME`（`base_dir` 为空时使用当前目录），不存在则写出默认配置。
///
/// 用户文件缺少的字段会以默认值补齐并回写，保证注释与字段列表始终完整。
pub fn load_or_create<T: ConfigSpec>(base_dir: Option<&Path>) -> Result<T, ConfigError> {
    let path = match base_dir {
        Some(base) => base.join(T::FILE_NAME),
        None => PathBuf::from(T::FILE_NAME),
    };
    ensure_parent(&path)?;

    if !path.exists() {
        let config = T::default();
        write_with_comments(&config, &path)?;
        return Ok(config);
    }

    let user_yaml = read_yaml(&path)?;
    let missing = missing_fields::<T>(&user_yaml);

    let mut merged = serde_yaml::to_value(T::default())
        .map_err(|err| ConfigError::Validation(err.to_string()))?;
    merge_values(&mut merged, user_yaml);

    let config: T =
        serde_yaml::from_value(merged).map_err(|err| ConfigError::Validation(err.to_string()))?;
    config.validate()?;

    if missing {
        write_with_comments(&config, &path)?;
    }
    Ok(config)
}

pub fn write_with_comments<T: ConfigSpec>(config: &T, path: &Path) -> Result<(), ConfigError> {
    ensure_parent(path)?;
    let yaml = render_with_comments(config)?;
    fs::write(path, yaml).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn render_with_comments<T: ConfigSpec>(config: &T) -> Result<String, ConfigError> {
    let Value::Mapping(mapping) =
        serde_yaml::to_value(config).map_err(|err| ConfigError::Validation(err.to_string()))?
    else {
        return Err(ConfigError::Validation(
            "config must serialize to a mapping".to_string(),
        ));
    };

    let mut lines = Vec::with_capacity(T::fields().len() * 2);
    for field in T::fields() {
        if !field.description.is_empty() {
            lines.push(format!("# {}", field.description.replace('\n', "\n# ")));
        }
        let key = Value::String(field.name.to_string());
        let val = mapping.get(&key).cloned().unwrap_or(Value::Null);
        let entry = serde_yaml::to_string(&serde_yaml::Mapping::from_iter([(key, val)]))
            .map_err(|err| ConfigError::Validation(err.to_string()))?;
        lines.push(entry.trim().to_string());
    }
    lines.push(String::new());

    Ok(lines.join("\n"))
}

fn read_yaml(path: &Path) -> Result<Value, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn missing_fields<T: ConfigSpec>(user_yaml: &Value) -> bool {
    let Value::Mapping(map) = user_yaml else {
        return true;
    };
    T::fields()
        .iter()
        .any(|field| !map.contains_key(Value::String(field.name.to_string())))
}

fn merge_values(default: &mut Value, user: Value) {
    match (default, user) {
        (Value::Mapping(dest), Value::Mapping(src)) => {
            for (key, user_val) in src {
                match dest.get_mut(&key) {
                    Some(dest_val) => merge_values(dest_val, user_val),
                    None => {
                        dest.insert(key, user_val);
                    }
                }
            }
        }
        // 空值（例如 `save_path:` 留空）保留默认
        (_, Value::Null) => {}
        (dest, other) => *dest = other,
    }
}

fn ensure_parent(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}
