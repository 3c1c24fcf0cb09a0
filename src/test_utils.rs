// test_utils.rs

#[cfg(test)]
pub mod test_utils {
    use std::env;
    use std::path::{Path, PathBuf};
    use tempfile;

    use crate::levels::{LevelMetadata, SchemeKind, METADATA_VERSION};
    use crate::minimiser::MinimiserConfig;

    pub struct TestDir {
        dir: PathBuf,
        #[allow(dead_code)]
        temp_dir: Option<tempfile::TempDir>,
    }

    impl TestDir {
        pub fn new(prefix: &str) -> std::io::Result<Self> {
            let keep_output = env::var("KEEP_TEST_OUTPUT").is_ok();
            if keep_output {
                let output_dir = env::current_dir()?.join("test_output").join(prefix);
                std::fs::create_dir_all(&output_dir)?;
                Ok(TestDir {
                    dir: output_dir,
                    temp_dir: None,
                })
            } else {
                let temp_dir = tempfile::tempdir()?;
                let dir = temp_dir.path().to_path_buf();
                Ok(TestDir {
                    dir,
                    temp_dir: Some(temp_dir),
                })
            }
        }

        pub fn path(&self) -> &Path {
            &self.dir
        }
    }

    /// Two bins ("liver", "brain") at global thresholds 1, 2 and 4.
    pub fn make_test_metadata() -> LevelMetadata {
        let bin_names = ["liver", "brain"]
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), i))
            .collect();
        LevelMetadata {
            format_version: METADATA_VERSION,
            bin_count: 2,
            hash_count: 2,
            fpr: vec![0.05, 0.05, 0.05],
            bin_sizes: vec![1024, 1024, 1024],
            compressed: false,
            bin_names,
            scheme: SchemeKind::Global {
                thresholds: vec![1, 2, 4],
            },
            minimiser: MinimiserConfig::default(),
        }
    }
}
