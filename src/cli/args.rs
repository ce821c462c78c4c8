use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tls-relay")]
#[command(author, version, about = "TLS-terminating forward relay", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)，RUST_LOG 优先
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行中继
    Run {
        /// 配置文件路径（省略时全部使用默认值）
        #[arg(short, long)]
        config: Option<String>,

        /// 覆盖配置中的监听端口
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,

        /// 输出格式 (text, json)
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
    /// 生成示例配置
    Template {
        /// 输出文件路径（省略时打印到标准输出）
        #[arg(short, long)]
        output: Option<String>,
    },
    /// 生成自签名证书
    Cert {
        /// 证书输出路径
        #[arg(long, value_name = "PATH", default_value = "cert/cert.pem")]
        cert_out: String,

        /// 私钥输出路径
        #[arg(long, value_name = "PATH", default_value = "cert/key.pem")]
        key_out: String,

        /// 证书的 Common Name
        #[arg(long, default_value = "localhost")]
        common_name: String,

        /// 证书的 SubjectAltName（DNS 名或 IP 地址，用逗号分隔多个）
        #[arg(long, value_delimiter = ',', value_name = "NAME,...")]
        alt_names: Vec<String>,
    },
}
