// 压测流程：轮次调度、统计汇总、停止判断、并发爬坡、参数矩阵扫描与单请求速度。
pub mod dispatcher;
pub mod ramp;
pub mod speed;
pub mod statistics;
pub mod stop;
pub mod sweep;
